//! The non-RT half of the watcher manager.
//!
//! [`WatchHub`] holds everything the control plane needs without touching
//! RT-owned state: the registry snapshot, the published clock, the command
//! pipe's producer side and the transport. It also runs the manager worker,
//! a plain thread that turns RT events into asynchronous JSON responses and
//! services log-flush requests, polling with a bounded sleep so teardown
//! stays responsive.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::control;
use crate::pipe::{CommandSender, EventReceiver, NonRtEvent, ToNonRtMsg};
use crate::transport::{NullTransport, Transport};
use crate::var::{VarHandle, VarShared};

/// Worker poll interval. Short so a teardown flag is seen promptly.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Shared, non-RT state of one watcher manager.
pub struct WatchHub {
    /// Registered variables, indexed by handle. Entries are only appended
    /// (setup) or retired in place (teardown), so steady-state readers can
    /// scan without coordination beyond the read lock.
    vars: RwLock<Vec<Arc<VarShared>>>,
    /// Clock mirror published by the RT thread each tick.
    clock: AtomicU64,
    /// Sample rate published to hosts in the list response (f32 bits).
    sample_rate: AtomicU32,
    next_buffer_id: AtomicU32,
    commands: CommandSender,
    transport: RwLock<Arc<dyn Transport>>,
    log_dir: PathBuf,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatchHub {
    pub(crate) fn new(commands: CommandSender, sample_rate: f32, log_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            vars: RwLock::new(Vec::new()),
            clock: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate.to_bits()),
            next_buffer_id: AtomicU32::new(0),
            commands,
            transport: RwLock::new(Arc::new(NullTransport)),
            log_dir,
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>, events: EventReceiver) {
        let hub = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("vartap-worker".into())
            .spawn(move || worker_loop(hub, events))
            .expect("spawning the manager worker");
        *self.worker.lock() = Some(handle);
    }

    // ── registry ────────────────────────────────────────────────────────

    pub(crate) fn register_shared(&self, shared: Arc<VarShared>) -> VarHandle {
        let mut vars = self.vars.write();
        let handle = VarHandle(vars.len() as u32);
        vars.push(shared);
        handle
    }

    /// Looks a live variable up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(VarHandle, Arc<VarShared>)> {
        self.vars
            .read()
            .iter()
            .enumerate()
            .find(|(_, v)| v.is_alive() && v.name() == name)
            .map(|(i, v)| (VarHandle(i as u32), Arc::clone(v)))
    }

    /// Snapshot of all registry entries, retired ones included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<VarShared>> {
        self.vars.read().clone()
    }

    pub(crate) fn shared_for(&self, handle: VarHandle) -> Option<Arc<VarShared>> {
        self.vars.read().get(handle.index()).cloned()
    }

    pub(crate) fn reserve_buffer_id(&self) -> u32 {
        self.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── published clock & configuration ─────────────────────────────────

    pub(crate) fn publish_clock(&self, timestamp: u64) {
        self.clock.store(timestamp, Ordering::Relaxed);
    }

    /// The most recently published tick timestamp.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Sample rate reported in the list response.
    #[must_use]
    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    /// Directory log files are created in.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Pointer-sized identifier written into log headers so records from
    /// one run correlate.
    #[must_use]
    pub fn manager_id(&self) -> usize {
        self as *const Self as usize
    }

    // ── transport & control plane ───────────────────────────────────────

    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = transport;
    }

    /// The currently attached transport.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport.read())
    }

    pub(crate) fn commands(&self) -> &CommandSender {
        &self.commands
    }

    /// Entry point for the control channel: parses one JSON request and
    /// applies it. Called on the transport thread.
    pub fn handle_control(&self, text: &str) {
        control::handle_request(self, text);
    }

    // ── teardown ────────────────────────────────────────────────────────

    /// Stops the worker and closes any open log writers.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("[Watcher] manager worker panicked");
            }
        }
        for shared in self.vars.read().iter() {
            if let Some(logger) = shared.take_logger() {
                if let Err(e) = logger.close() {
                    log::error!("[Log] closing '{}' failed: {}", logger.file_name(), e);
                }
            }
        }
    }
}

fn worker_loop(hub: Arc<WatchHub>, mut events: EventReceiver) {
    while !hub.stop.load(Ordering::Relaxed) {
        let mut worked = false;
        while let Some(msg) = events.try_recv() {
            worked = true;
            handle_event(&hub, msg);
        }

        // Service flush requests raised by the RT thread on LAST frames.
        for shared in hub.vars.read().iter() {
            if let Some(logger) = shared.logger() {
                match logger.service_flush() {
                    Ok(true) => worked = true,
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("[Log] flush of '{}' failed: {}", logger.file_name(), e)
                    }
                }
            }
        }

        if !worked {
            std::thread::sleep(WORKER_POLL);
        }
    }
}

fn handle_event(hub: &WatchHub, msg: ToNonRtMsg) {
    match msg.event {
        NonRtEvent::StartedLogging {
            actual_start,
            actual_end,
        } => {
            let Some(shared) = hub.shared_for(msg.handle) else {
                return;
            };
            let body = json!({
                "watcher": {
                    "watcher": shared.name(),
                    "logFileName": shared.log_file_name(),
                    "timestamp": actual_start,
                    "timestampEnd": actual_end,
                }
            });
            hub.transport().send_control(body);
        }
    }
}
