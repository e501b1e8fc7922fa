//! Scheduled start/stop state machine for the stream and log channels.
//!
//! Each watched variable carries two of these, one per output. Transitions
//! are armed by control commands on the non-RT side and fire on the RT
//! thread when the clock passes the scheduled timestamp.

/// Sentinel for "no scheduled timestamp" / "no automatic end".
pub const NEVER: u64 = u64::MAX;

/// Index of the log channel in a variable's channel array.
pub const CHANNEL_LOG: usize = 0;
/// Index of the stream-to-host channel.
pub const CHANNEL_STREAM: usize = 1;
/// Channels per variable.
pub const CHANNEL_COUNT: usize = 2;

/// State of one stream/log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Quiescent.
    #[default]
    No,
    /// Armed to begin at `sched_start`.
    Starting,
    /// Actively filling frames.
    Yes,
    /// Armed to end at `sched_start`.
    Stopping,
    /// The current partial frame must be flushed as the final block.
    Last,
}

/// One channel's schedule and state.
#[derive(Debug)]
pub struct StreamChannel {
    pub state: ChannelState,
    /// Next transition timestamp; `NEVER` when nothing is pending.
    pub sched_start: u64,
    /// Automatic end timestamp; `NEVER` when the window stays open.
    pub sched_end: u64,
}

impl StreamChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::No,
            sched_start: NEVER,
            sched_end: NEVER,
        }
    }

    /// Whether the channel currently consumes appends.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Yes | ChannelState::Stopping | ChannelState::Last
        )
    }

    /// Whether a scheduled transition is pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.sched_start != NEVER
    }

    /// Arms the channel to start at `start` for `duration` ticks.
    ///
    /// A start in the past clamps to `now`; duration 0 means no automatic
    /// end. Returns the actual (clamped) start and end timestamps.
    pub fn start_at(&mut self, now: u64, start: u64, duration: u64) -> (u64, u64) {
        let start = start.max(now);
        let end = if duration == 0 {
            NEVER
        } else {
            start + duration
        };
        self.state = ChannelState::Starting;
        self.sched_start = start;
        self.sched_end = end;
        (start, end)
    }

    /// Arms the channel to stop at `end`. No-op when quiescent.
    ///
    /// Returns whether the channel was active.
    pub fn stop_at(&mut self, end: u64) -> bool {
        if self.state == ChannelState::No {
            return false;
        }
        self.state = ChannelState::Stopping;
        self.sched_start = end;
        true
    }

    /// Fires a due transition, if any.
    ///
    /// Returns `(became_active, entered_last)`: `became_active` asks the
    /// caller to reset the frame buffer for a fresh window, `entered_last`
    /// marks the current frame as the window's final block.
    pub fn advance(&mut self, now: u64) -> (bool, bool) {
        if now < self.sched_start {
            return (false, false);
        }
        self.sched_start = NEVER;
        match self.state {
            ChannelState::Starting => {
                self.state = ChannelState::Yes;
                if self.sched_end != NEVER {
                    // An end was scheduled up front: arm it immediately so
                    // the window terminates on its own.
                    self.sched_start = self.sched_end;
                    self.state = ChannelState::Stopping;
                }
                (true, false)
            }
            ChannelState::Stopping => {
                self.state = ChannelState::Last;
                (false, true)
            }
            _ => (false, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_are_clamped_to_the_clock() {
        let mut ch = StreamChannel::new();
        let (start, end) = ch.start_at(100, 40, 10);
        assert_eq!(start, 100);
        assert_eq!(end, 110);
        assert_eq!(ch.state, ChannelState::Starting);
    }

    #[test]
    fn duration_zero_means_no_automatic_end() {
        let mut ch = StreamChannel::new();
        let (_, end) = ch.start_at(0, 5, 0);
        assert_eq!(end, NEVER);

        // Window opens and stays open
        assert_eq!(ch.advance(5), (true, false));
        assert_eq!(ch.state, ChannelState::Yes);
        assert!(!ch.has_pending());
    }

    #[test]
    fn bounded_window_arms_its_own_end() {
        let mut ch = StreamChannel::new();
        ch.start_at(0, 5, 10);

        // Not due yet
        assert_eq!(ch.advance(4), (false, false));
        assert_eq!(ch.state, ChannelState::Starting);

        // Opens at 5 and immediately schedules the stop at 15
        assert_eq!(ch.advance(5), (true, false));
        assert_eq!(ch.state, ChannelState::Stopping);
        assert_eq!(ch.sched_start, 15);

        // Ends at 15
        assert_eq!(ch.advance(15), (false, true));
        assert_eq!(ch.state, ChannelState::Last);
    }

    #[test]
    fn stop_on_quiescent_channel_is_a_no_op() {
        let mut ch = StreamChannel::new();
        assert!(!ch.stop_at(0));
        assert_eq!(ch.state, ChannelState::No);
        assert!(!ch.has_pending());
    }

    #[test]
    fn stop_in_the_past_applies_on_next_advance() {
        let mut ch = StreamChannel::new();
        ch.start_at(0, 0, 0);
        ch.advance(0);
        assert_eq!(ch.state, ChannelState::Yes);

        assert!(ch.stop_at(3));
        assert_eq!(ch.advance(7), (false, true));
        assert_eq!(ch.state, ChannelState::Last);
    }

    #[test]
    fn restart_while_streaming_reopens_the_window() {
        let mut ch = StreamChannel::new();
        ch.start_at(0, 0, 0);
        ch.advance(0);

        // A second watch while already watching re-arms the same way a
        // first one would; the steady state is identical.
        ch.start_at(10, 10, 0);
        assert_eq!(ch.state, ChannelState::Starting);
        assert_eq!(ch.advance(10), (true, false));
        assert_eq!(ch.state, ChannelState::Yes);
    }
}
