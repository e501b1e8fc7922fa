//! The RT half of the watcher manager.
//!
//! [`Watcher`] is owned by the audio runtime's setup scope and lives on the
//! RT thread once the callback starts: [`Watcher::tick`] at the top of every
//! callback, then plain assignments to [`Watched`] cells, which funnel into
//! [`Watcher::notify`]. Nothing here allocates or blocks on the steady path;
//! the only locks in sight are inside the transport copy and the log
//! writer's append, both sanctioned hand-off points.
//!
//! Registration and unregistration happen from the setup scope before the
//! RT thread starts and after it stops.

use std::sync::Arc;

use crate::channel::{
    ChannelState, StreamChannel, CHANNEL_COUNT, CHANNEL_LOG, CHANNEL_STREAM, NEVER,
};
use crate::error::WatchResult;
use crate::frame::FrameBuffer;
use crate::hub::WatchHub;
use crate::logwriter::BinaryLogger;
use crate::pipe::{
    command_pipe, event_pipe, CommandReceiver, EventSender, NonRtEvent, RtCommand, ToNonRtMsg,
    ToRtMsg,
};
use crate::transport::{NullTransport, Transport};
use crate::value::{TimestampMode, WatchKind};
use crate::var::{VarHandle, VarShared, Watched, MONITOR_CHANGE, MONITOR_OFF};
use crate::wire::monitor_packet;

/// Knobs fixed at manager construction.
pub struct WatcherConfig {
    /// Published to hosts in the list response; scheduling itself is in
    /// clock units, not seconds.
    pub sample_rate: f32,
    /// To-RT command pipe capacity.
    pub command_capacity: usize,
    /// RT-to-worker event pipe capacity.
    pub event_capacity: usize,
    /// Directory log files are created in.
    pub log_dir: std::path::PathBuf,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            command_capacity: 1024,
            event_capacity: 256,
            log_dir: std::path::PathBuf::from("."),
        }
    }
}

/// RT-exclusive state of one variable.
struct VarRt {
    shared: Arc<VarShared>,
    frame: FrameBuffer,
    /// Log channel first, stream channel second (see [`CHANNEL_LOG`]).
    channels: [StreamChannel; CHANNEL_COUNT],
    monitor_next: u64,
    /// Cache: false means notify has nothing to look at.
    something_to_do: bool,
    logger: Option<Arc<BinaryLogger>>,
}

/// The watcher manager's RT half.
pub struct Watcher {
    hub: Arc<WatchHub>,
    vars: Vec<VarRt>,
    commands: CommandReceiver,
    events: EventSender,
    transport: Arc<dyn Transport>,
    timestamp: u64,
    client_active: bool,
}

impl Watcher {
    /// Builds a manager pair: the RT half and the shared hub.
    ///
    /// Spawns the manager worker; tear it down with [`WatchHub::shutdown`].
    pub fn new(config: WatcherConfig) -> (Self, Arc<WatchHub>) {
        let (cmd_tx, cmd_rx) = command_pipe(config.command_capacity);
        let (evt_tx, evt_rx) = event_pipe(config.event_capacity);
        let hub = WatchHub::new(cmd_tx, config.sample_rate, config.log_dir);
        hub.spawn_worker(evt_rx);

        let watcher = Self {
            hub: Arc::clone(&hub),
            vars: Vec::new(),
            commands: cmd_rx,
            events: evt_tx,
            transport: Arc::new(NullTransport),
            timestamp: 0,
            client_active: false,
        };
        (watcher, hub)
    }

    /// The shared half.
    #[must_use]
    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    /// The clock as of the last tick.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Attaches the host transport. Call from the setup scope, before the
    /// RT thread starts.
    pub fn bind_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Arc::clone(&transport);
        self.hub.set_transport(transport);
    }

    /// Registers a watched variable.
    ///
    /// Reserves a transport buffer id, allocates the frame buffer and
    /// precomputes its fill limits. Fails only when the frame buffer cannot
    /// satisfy the value-alignment invariant.
    pub fn register<T: WatchKind>(
        &mut self,
        name: &str,
        mode: TimestampMode,
    ) -> WatchResult<Watched<T>> {
        let frame = FrameBuffer::new(name, T::KIND, mode)?;
        let buffer_id = self.hub.reserve_buffer_id();
        let shared = Arc::new(VarShared::new(name.to_string(), T::KIND, mode, buffer_id));
        let handle = self.hub.register_shared(Arc::clone(&shared));
        debug_assert_eq!(handle.index(), self.vars.len());

        self.vars.push(VarRt {
            shared: Arc::clone(&shared),
            frame,
            channels: [StreamChannel::new(), StreamChannel::new()],
            monitor_next: NEVER,
            something_to_do: false,
            logger: None,
        });
        Ok(Watched::new(shared, handle))
    }

    /// Removes a variable: closes its log, releases its transport buffer,
    /// retires its registry entry. Call from the teardown scope.
    pub fn unregister<T: WatchKind>(&mut self, watched: Watched<T>) {
        let Some(var) = self.vars.get_mut(watched.handle.index()) else {
            return;
        };
        var.shared.retire();
        var.channels = [StreamChannel::new(), StreamChannel::new()];
        var.frame.reset();
        var.something_to_do = false;
        var.shared.set_stream_active(false);
        var.shared.set_log_active(false);
        var.logger = None;
        if let Some(logger) = var.shared.take_logger() {
            if let Err(e) = logger.close() {
                log::error!("[Log] closing '{}' failed: {}", logger.file_name(), e);
            }
        }
    }

    /// Advances the clock and applies pending control commands.
    ///
    /// Call at the top of every audio callback with the frame-elapsed
    /// counter; all scheduling is expressed in this unit.
    pub fn tick(&mut self, frames: u64) {
        self.timestamp = frames;
        self.hub.publish_clock(frames);

        let Self {
            vars,
            commands,
            events,
            ..
        } = self;
        commands.drain(|msg| apply_command(vars, events, frames, msg));

        self.client_active = self.transport.active_connections() > 0;
    }

    /// Observes one assignment. Called by [`Watched::set`].
    pub fn notify(&mut self, handle: VarHandle, bits: u64) {
        let Self {
            vars,
            transport,
            timestamp,
            client_active,
            ..
        } = self;
        let now = *timestamp;
        let client_active = *client_active;

        let Some(var) = vars.get_mut(handle.index()) else {
            return;
        };
        // The cache covers everything except a monitor-period change that
        // has not reached the RT thread yet; that one is a relaxed load.
        if !var.something_to_do && var.shared.monitoring_raw() == MONITOR_OFF {
            return;
        }

        // 1. Fire due channel transitions.
        let mut entered_last = false;
        let mut transitioned = false;
        let mut fresh_window = false;
        for ch in &mut var.channels {
            if ch.has_pending() && now >= ch.sched_start {
                transitioned = true;
                let (became_active, last) = ch.advance(now);
                fresh_window |= became_active;
                entered_last |= last;
            }
        }
        if fresh_window {
            var.frame.reset();
        }
        if transitioned {
            update_var(var);
        }

        // 2. Monitor emission.
        let raw = var.shared.monitoring_raw();
        if raw != MONITOR_OFF {
            let period = raw & !MONITOR_CHANGE;
            if raw & MONITOR_CHANGE != 0 {
                var.shared.clear_monitor_change();
                if period != 0 {
                    // Trigger one emission immediately.
                    var.monitor_next = now;
                } else {
                    var.monitor_next = NEVER;
                    update_var(var);
                }
            }
            if period != 0 && now >= var.monitor_next {
                if client_active {
                    let (packet, len) = monitor_packet(var.shared.kind(), now, bits);
                    transport.send_buffer(
                        var.shared.buffer_id(),
                        var.shared.kind(),
                        &packet[..len],
                    );
                }
                if period == 1 {
                    // One-shot: disarm on the next notify.
                    var.shared.store_monitoring_raw(MONITOR_CHANGE);
                    update_var(var);
                } else {
                    var.monitor_next = now + period as u64;
                }
            }
        }

        // 3. Frame append and hand-off.
        let watching = var.channels[CHANNEL_STREAM].is_streaming() && client_active;
        let logging = var.channels[CHANNEL_LOG].is_streaming();
        if !(watching || logging) {
            return;
        }

        let any_open = var
            .channels
            .iter()
            .any(|c| matches!(c.state, ChannelState::Yes | ChannelState::Stopping));

        let mut flushed = false;
        if any_open {
            if var.frame.is_empty() {
                var.frame.begin(now);
            }
            let full = var.frame.append(bits, now);
            if full || entered_last {
                if !full {
                    var.frame.zero_fill_tail();
                }
                hand_off(var, transport.as_ref(), client_active);
                flushed = true;
            }
        } else if entered_last {
            // Every window closed exactly at this tick; the triggering
            // assignment falls outside them and is not recorded.
            if !var.frame.is_empty() {
                var.frame.zero_fill_tail();
                hand_off(var, transport.as_ref(), client_active);
            }
            flushed = true;
        }

        if flushed {
            var.frame.reset();
            for (idx, ch) in var.channels.iter_mut().enumerate() {
                if ch.state == ChannelState::Last {
                    if idx == CHANNEL_LOG {
                        if let Some(logger) = &var.logger {
                            logger.request_flush();
                        }
                    }
                    ch.state = ChannelState::No;
                }
            }
            update_var(var);
        }
    }

    #[cfg(test)]
    fn channel_state(&self, handle: VarHandle, idx: usize) -> ChannelState {
        self.vars[handle.index()].channels[idx].state
    }

    #[cfg(test)]
    fn frame_is_empty(&self, handle: VarHandle) -> bool {
        self.vars[handle.index()].frame.is_empty()
    }
}

impl<T: WatchKind> Watched<T> {
    /// Assigns the local value and notifies the manager.
    ///
    /// Total and bounded: the slow paths behind notify are a frame copy
    /// into the transport queue and a buffered log append.
    pub fn set(&mut self, watcher: &mut Watcher, value: T) {
        self.local = value;
        self.shared.store_local(value.to_bits64());
        watcher.notify(self.handle, value.to_bits64());
    }
}

fn apply_command(vars: &mut [VarRt], events: &mut EventSender, now: u64, msg: ToRtMsg) {
    let Some(var) = vars.get_mut(msg.handle.index()) else {
        log::error!("[Watcher] command for unknown handle {}", msg.handle.index());
        return;
    };
    if !var.shared.is_alive() {
        return;
    }
    match msg.cmd {
        RtCommand::StartWatching { start, duration } => {
            var.channels[CHANNEL_STREAM].start_at(now, start, duration);
        }
        RtCommand::StopWatching { end } => {
            var.channels[CHANNEL_STREAM].stop_at(end);
        }
        RtCommand::StartLogging {
            start,
            duration,
            logger,
        } => {
            var.logger = Some(logger);
            let (actual_start, actual_end) = var.channels[CHANNEL_LOG].start_at(now, start, duration);
            events.send(ToNonRtMsg {
                handle: msg.handle,
                event: NonRtEvent::StartedLogging {
                    actual_start,
                    actual_end,
                },
            });
        }
        RtCommand::StopLogging { end } => {
            var.channels[CHANNEL_LOG].stop_at(end);
        }
    }
    update_var(var);
}

/// Recomputes the something-to-do cache and the control-plane mirrors.
fn update_var(var: &mut VarRt) {
    var.shared
        .set_stream_active(var.channels[CHANNEL_STREAM].is_streaming());
    var.shared
        .set_log_active(var.channels[CHANNEL_LOG].is_streaming());
    var.something_to_do = var
        .channels
        .iter()
        .any(|c| c.state != ChannelState::No || c.has_pending())
        || var.shared.monitoring_raw() != MONITOR_OFF;
}

/// Hands the completed frame to the stream and/or log outputs.
///
/// Both see the same bytes; stream is gated on a connected host, log on
/// writer health. A failed log write drops the channel back to quiescent.
fn hand_off(var: &mut VarRt, transport: &dyn Transport, client_active: bool) {
    if client_active && var.channels[CHANNEL_STREAM].is_streaming() {
        transport.send_buffer(var.shared.buffer_id(), var.shared.kind(), var.frame.bytes());
    }

    let log_error = match &var.logger {
        Some(logger) if var.channels[CHANNEL_LOG].is_streaming() => {
            logger.append(var.frame.bytes()).err()
        }
        _ => None,
    };
    if let Some(e) = log_error {
        log::error!("[Log] append for '{}' failed: {}", var.shared.name(), e);
        var.channels[CHANNEL_LOG] = StreamChannel::new();
        var.logger = None;
        var.shared.set_log_active(false);
    }
}
