//! WebSocket connection tracking.
//!
//! The manager only needs two things from the connection layer: a live
//! count (it gates stream and monitor emission on the RT thread) and a way
//! to force-close everything at shutdown. Guards keep the count honest even
//! when a handler exits early.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks all active WebSocket connections.
pub struct WsConnectionManager {
    count: AtomicUsize,
    next_id: AtomicU64,
    /// Cancelled to close every connection; replaced afterwards so new
    /// connections can still attach.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection; the returned guard unregisters on drop.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("[WS] connection ws-{id} registered (total: {total})");
        ConnectionGuard {
            id,
            manager: Arc::clone(self),
            cancel_token: self.global_cancel.read().child_token(),
        }
    }

    /// Number of currently attached hosts.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Signals every connection handler to terminate.
    pub fn close_all(&self) {
        let mut guard = self.global_cancel.write();
        guard.cancel();
        *guard = CancellationToken::new();
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one connection.
pub struct ConnectionGuard {
    id: u64,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// Numeric connection id, for log lines.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelled on force-close; select on it in the handler loop.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.manager.count.fetch_sub(1, Ordering::Relaxed) - 1;
        log::info!(
            "[WS] connection ws-{} unregistered (remaining: {remaining})",
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_keep_the_count_accurate() {
        let manager = Arc::new(WsConnectionManager::new());
        assert_eq!(manager.connection_count(), 0);

        let a = manager.register();
        let b = manager.register();
        assert_eq!(manager.connection_count(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        assert_eq!(manager.connection_count(), 1);
        drop(b);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn close_all_cancels_existing_tokens_only() {
        let manager = Arc::new(WsConnectionManager::new());
        let old = manager.register();
        manager.close_all();
        assert!(old.cancel_token().is_cancelled());

        let new = manager.register();
        assert!(!new.cancel_token().is_cancelled());
    }
}
