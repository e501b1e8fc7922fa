//! Cross-thread command pipe between the control plane and the RT thread.
//!
//! The to-RT direction is a bounded lock-free SPSC ring plus a published
//! message count: producers batch their pushes, issue a release fence and
//! bump `sent` once; the RT consumer drains exactly `sent − received`
//! messages non-blockingly at the top of every tick. A short read means the
//! two sides disagree; the consumer logs the loss and fast-forwards
//! `received` to resynchronise rather than drift forever.
//!
//! The to-non-RT direction is plain: the RT thread pushes, the worker polls
//! with a bounded sleep.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::RingBuffer;

use crate::error::WatchError;
use crate::logwriter::BinaryLogger;
use crate::var::VarHandle;

/// Command delivered to the RT thread.
pub enum RtCommand {
    StartWatching {
        start: u64,
        duration: u64,
    },
    StopWatching {
        end: u64,
    },
    /// Carries the freshly-opened writer so the RT thread never takes a
    /// lock to reach it.
    StartLogging {
        start: u64,
        duration: u64,
        logger: Arc<BinaryLogger>,
    },
    StopLogging {
        end: u64,
    },
}

/// One to-RT message.
pub struct ToRtMsg {
    pub handle: VarHandle,
    pub cmd: RtCommand,
}

/// Event flowing back from the RT thread to the worker.
pub enum NonRtEvent {
    /// Logging actually began; carries the clamped window.
    StartedLogging { actual_start: u64, actual_end: u64 },
}

/// One to-non-RT message.
pub struct ToNonRtMsg {
    pub handle: VarHandle,
    pub event: NonRtEvent,
}

/// Producer half of the to-RT pipe.
///
/// The lock only serialises concurrent control connections; the RT side
/// never touches it.
pub struct CommandSender {
    producer: Mutex<rtrb::Producer<ToRtMsg>>,
    sent: Arc<AtomicU64>,
}

impl CommandSender {
    /// Queues a batch and publishes it with a single release-fenced count
    /// bump, preserving array order within the batch.
    ///
    /// Returns how many messages were queued; on a full ring the remainder
    /// of the batch is dropped with an error line.
    pub fn publish(&self, batch: impl IntoIterator<Item = ToRtMsg>) -> u64 {
        let mut producer = self.producer.lock();
        let mut queued = 0u64;
        for msg in batch {
            match producer.push(msg) {
                Ok(()) => queued += 1,
                Err(_) => {
                    log::error!("[Watcher] command pipe full, dropping rest of batch");
                    break;
                }
            }
        }
        if queued > 0 {
            fence(Ordering::Release);
            self.sent.fetch_add(queued, Ordering::Relaxed);
        }
        queued
    }

    #[cfg(test)]
    pub(crate) fn force_publish_count(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }
}

/// Consumer half of the to-RT pipe; owned by the RT thread.
pub struct CommandReceiver {
    consumer: rtrb::Consumer<ToRtMsg>,
    sent: Arc<AtomicU64>,
    received: u64,
}

impl CommandReceiver {
    /// Drains every published message, in order, without blocking.
    ///
    /// On a short read the missing messages are counted as lost and
    /// `received` is fast-forwarded to the published count.
    pub fn drain(&mut self, mut apply: impl FnMut(ToRtMsg)) {
        let sent = self.sent.load(Ordering::Acquire);
        while self.received != sent {
            match self.consumer.pop() {
                Ok(msg) => {
                    self.received += 1;
                    apply(msg);
                }
                Err(_) => {
                    let lost = sent - self.received;
                    log::error!("[Watcher] {}", WatchError::PipeOverrun(lost));
                    self.received = sent;
                    break;
                }
            }
        }
    }
}

/// Creates the to-RT pipe with the given capacity.
pub fn command_pipe(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity);
    let sent = Arc::new(AtomicU64::new(0));
    (
        CommandSender {
            producer: Mutex::new(producer),
            sent: Arc::clone(&sent),
        },
        CommandReceiver {
            consumer,
            sent,
            received: 0,
        },
    )
}

/// Producer half of the to-non-RT pipe; owned by the RT thread.
pub struct EventSender {
    producer: rtrb::Producer<ToNonRtMsg>,
}

impl EventSender {
    /// Pushes an event; a full ring drops it with an error line (the worker
    /// is far behind — the RT thread must not wait for it).
    pub fn send(&mut self, msg: ToNonRtMsg) {
        if self.producer.push(msg).is_err() {
            log::error!("[Watcher] event pipe full, dropping event");
        }
    }
}

/// Consumer half of the to-non-RT pipe; owned by the worker.
pub struct EventReceiver {
    consumer: rtrb::Consumer<ToNonRtMsg>,
}

impl EventReceiver {
    /// Non-blocking read; the worker sleeps between empty polls.
    pub fn try_recv(&mut self) -> Option<ToNonRtMsg> {
        self.consumer.pop().ok()
    }
}

/// Creates the to-non-RT pipe with the given capacity.
pub fn event_pipe(capacity: usize) -> (EventSender, EventReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (EventSender { producer }, EventReceiver { consumer })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(handle: u32, end: u64) -> ToRtMsg {
        ToRtMsg {
            handle: VarHandle(handle),
            cmd: RtCommand::StopWatching { end },
        }
    }

    #[test]
    fn batch_is_drained_in_order() {
        let (tx, mut rx) = command_pipe(8);
        tx.publish([msg(0, 1), msg(1, 2), msg(2, 3)]);

        let mut seen = Vec::new();
        rx.drain(|m| seen.push(m.handle.0));
        assert_eq!(seen, [0, 1, 2]);

        // Nothing further published, nothing further drained
        rx.drain(|_| panic!("unexpected message"));
    }

    #[test]
    fn separate_batches_accumulate() {
        let (tx, mut rx) = command_pipe(8);
        assert_eq!(tx.publish([msg(0, 0)]), 1);
        assert_eq!(tx.publish([msg(1, 0), msg(2, 0)]), 2);

        let mut count = 0;
        rx.drain(|_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn full_ring_drops_the_tail_of_the_batch() {
        let (tx, mut rx) = command_pipe(2);
        let queued = tx.publish([msg(0, 0), msg(1, 0), msg(2, 0)]);
        assert_eq!(queued, 2);

        let mut seen = Vec::new();
        rx.drain(|m| seen.push(m.handle.0));
        assert_eq!(seen, [0, 1]);
    }

    #[test]
    fn short_read_fast_forwards_received() {
        let (tx, mut rx) = command_pipe(8);
        // Publish a count with no messages behind it: the consumer must
        // resynchronise instead of spinning forever.
        tx.force_publish_count(3);
        rx.drain(|_| panic!("no message should be readable"));

        // Pipe works normally afterwards
        tx.publish([msg(7, 0)]);
        let mut seen = Vec::new();
        rx.drain(|m| seen.push(m.handle.0));
        assert_eq!(seen, [7]);
    }

    #[test]
    fn event_pipe_round_trip() {
        let (mut tx, mut rx) = event_pipe(4);
        tx.send(ToNonRtMsg {
            handle: VarHandle(3),
            event: NonRtEvent::StartedLogging {
                actual_start: 10,
                actual_end: 20,
            },
        });

        let msg = rx.try_recv().expect("event queued");
        assert_eq!(msg.handle, VarHandle(3));
        let NonRtEvent::StartedLogging {
            actual_start,
            actual_end,
        } = msg.event;
        assert_eq!((actual_start, actual_end), (10, 20));
    }
}
