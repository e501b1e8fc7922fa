//! The transport seam between the manager and the host connection.
//!
//! The RT thread calls [`Transport::send_buffer`] during a hand-off; the
//! call must never block, so implementations copy and queue. Control
//! responses go out as JSON on the same connection. The WebSocket
//! implementation lives in [`crate::api`]; [`NullTransport`] stands in
//! before a server is attached and in headless tests.

use serde_json::Value;

use crate::value::ValueKind;

/// Host-connection surface the manager emits through.
pub trait Transport: Send + Sync {
    /// Number of currently connected hosts. Zero gates stream and monitor
    /// emission; log output continues regardless.
    fn active_connections(&self) -> usize;

    /// Queues one binary frame on the given buffer id. Must not block;
    /// delivery is best-effort.
    fn send_buffer(&self, buffer_id: u32, kind: ValueKind, payload: &[u8]);

    /// Queues one JSON control response.
    fn send_control(&self, body: Value);
}

/// Transport that drops everything; reports no connections.
pub struct NullTransport;

impl Transport for NullTransport {
    fn active_connections(&self) -> usize {
        0
    }

    fn send_buffer(&self, _buffer_id: u32, _kind: ValueKind, _payload: &[u8]) {}

    fn send_control(&self, _body: Value) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::Value;

    use super::Transport;
    use crate::value::ValueKind;

    /// Records every send for assertions; connection count is settable.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub connections: AtomicUsize,
        pub buffers: Mutex<Vec<(u32, ValueKind, Vec<u8>)>>,
        pub controls: Mutex<Vec<Value>>,
    }

    impl RecordingTransport {
        pub fn connected() -> Self {
            let t = Self::default();
            t.connections.store(1, Ordering::Relaxed);
            t
        }
    }

    impl Transport for RecordingTransport {
        fn active_connections(&self) -> usize {
            self.connections.load(Ordering::Relaxed)
        }

        fn send_buffer(&self, buffer_id: u32, kind: ValueKind, payload: &[u8]) {
            self.buffers.lock().push((buffer_id, kind, payload.to_vec()));
        }

        fn send_control(&self, body: Value) {
            self.controls.lock().push(body);
        }
    }
}
