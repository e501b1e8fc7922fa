//! Per-variable shared state and the typed watched cell.
//!
//! [`VarShared`] is the word the control plane and the RT thread agree on:
//! every field the codec touches is a word-sized atomic (relaxed — per-value
//! eventual visibility is all the contract asks for) or a briefly-held lock
//! on the non-RT side. Everything frame-related stays RT-owned in the
//! manager and never appears here.
//!
//! [`Watched<T>`] is the cell application code holds: a plain typed value
//! whose assignments are observed by the manager, with an optional remote
//! override when the host takes control.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{WatchError, WatchResult};
use crate::logwriter::BinaryLogger;
use crate::value::{TimestampMode, ValueKind, WatchKind};

/// Monitor-period flag bit: a period change has not yet been applied by the
/// RT thread. The remaining bits carry the period itself.
pub(crate) const MONITOR_CHANGE: u32 = 1 << 31;

/// Monitoring disabled.
pub(crate) const MONITOR_OFF: u32 = 0;

/// Opaque, stable handle to a registered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarHandle(pub(crate) u32);

impl VarHandle {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Control-plane-visible state of one watched variable.
pub struct VarShared {
    name: String,
    kind: ValueKind,
    mode: TimestampMode,
    buffer_id: u32,
    alive: AtomicBool,
    /// Mirror of the last locally-assigned value, for the list response.
    local_bits: AtomicU64,
    /// Last value written by a remote `set` / `setMask`.
    remote_bits: AtomicU64,
    local_control: AtomicBool,
    controlled: AtomicBool,
    mask: AtomicU32,
    /// Monitor period plus [`MONITOR_CHANGE`]; written by the codec, applied
    /// exactly once per change by the RT thread.
    monitoring: AtomicU32,
    /// RT-maintained mirrors of the channel states, for the list response.
    stream_active: AtomicBool,
    log_active: AtomicBool,
    /// Current log file name; empty until the first `log` command.
    log_file: Mutex<String>,
    /// Worker-side handle to the active log writer (flush service, close).
    logger: Mutex<Option<Arc<BinaryLogger>>>,
}

impl VarShared {
    pub(crate) fn new(
        name: String,
        kind: ValueKind,
        mode: TimestampMode,
        buffer_id: u32,
    ) -> Self {
        Self {
            name,
            kind,
            mode,
            buffer_id,
            alive: AtomicBool::new(true),
            local_bits: AtomicU64::new(0),
            remote_bits: AtomicU64::new(0),
            local_control: AtomicBool::new(true),
            controlled: AtomicBool::new(false),
            mask: AtomicU32::new(0),
            monitoring: AtomicU32::new(MONITOR_OFF),
            stream_active: AtomicBool::new(false),
            log_active: AtomicBool::new(false),
            log_file: Mutex::new(String::new()),
            logger: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    #[must_use]
    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    /// Transport buffer id reserved for this variable's emissions.
    #[must_use]
    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub(crate) fn retire(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    // ── value cells ─────────────────────────────────────────────────────

    pub(crate) fn store_local(&self, bits: u64) {
        self.local_bits.store(bits, Ordering::Relaxed);
    }

    pub(crate) fn local_bits(&self) -> u64 {
        self.local_bits.load(Ordering::Relaxed)
    }

    pub(crate) fn remote_bits(&self) -> u64 {
        self.remote_bits.load(Ordering::Relaxed)
    }

    /// Writes the remote value, narrowing to the declared kind.
    pub fn set_remote(&self, value: f64) {
        self.remote_bits
            .store(self.kind.bits_from_f64(value), Ordering::Relaxed);
    }

    /// Masked remote write: clears the bits selected by `mask`, ORs in
    /// `value & mask`. Integer kinds only.
    pub fn set_remote_masked(&self, value: f64, mask: u32) -> WatchResult<()> {
        if !self.kind.is_integer() {
            return Err(WatchError::TypeMismatch {
                name: self.name.clone(),
                expected: "integer kind",
                got: self.kind.code().to_string(),
            });
        }
        self.mask.store(mask, Ordering::Relaxed);
        let value = self.kind.bits_from_f64(value) as u32;
        let current = self.remote_bits.load(Ordering::Relaxed) as u32;
        let next = (current & !mask) | (value & mask);
        self.remote_bits.store(next as u64, Ordering::Relaxed);
        Ok(())
    }

    /// The value as the host sees it: local under local control, remote
    /// otherwise.
    #[must_use]
    pub fn value_f64(&self) -> f64 {
        let bits = if self.has_local_control() {
            self.local_bits()
        } else {
            self.remote_bits()
        };
        self.kind.bits_to_f64(bits)
    }

    /// The last locally-assigned value, regardless of control.
    #[must_use]
    pub fn local_value_f64(&self) -> f64 {
        self.kind.bits_to_f64(self.local_bits())
    }

    // ── control flags ───────────────────────────────────────────────────

    #[must_use]
    pub fn has_local_control(&self) -> bool {
        self.local_control.load(Ordering::Relaxed)
    }

    /// Enables or disables local control.
    ///
    /// Disabling seeds the remote value from the current local value so the
    /// variable does not snap to whatever stale remote value existed.
    pub fn set_local_control(&self, enable: bool) {
        if self.local_control.swap(enable, Ordering::Relaxed) != enable && !enable {
            self.remote_bits
                .store(self.local_bits(), Ordering::Relaxed);
        }
    }

    /// Marks the variable host-controlled and hands the value source over.
    pub fn start_controlling(&self) {
        if !self.controlled.swap(true, Ordering::Relaxed) {
            self.set_local_control(false);
        }
    }

    /// Returns the value source to the local writer.
    pub fn stop_controlling(&self) {
        if self.controlled.swap(false, Ordering::Relaxed) {
            self.set_local_control(true);
        }
    }

    #[must_use]
    pub fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::Relaxed)
    }

    // ── monitoring ──────────────────────────────────────────────────────

    /// Schedules a new monitor period; the RT thread applies it on the next
    /// notify via the change flag.
    pub fn set_monitor_period(&self, period: u32) {
        self.monitoring
            .store(MONITOR_CHANGE | (period & !MONITOR_CHANGE), Ordering::Relaxed);
    }

    /// Current period without the change flag.
    #[must_use]
    pub fn monitor_period(&self) -> u32 {
        self.monitoring.load(Ordering::Relaxed) & !MONITOR_CHANGE
    }

    pub(crate) fn monitoring_raw(&self) -> u32 {
        self.monitoring.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_monitor_change(&self) {
        self.monitoring.fetch_and(!MONITOR_CHANGE, Ordering::Relaxed);
    }

    pub(crate) fn store_monitoring_raw(&self, raw: u32) {
        self.monitoring.store(raw, Ordering::Relaxed);
    }

    // ── channel mirrors & logging ───────────────────────────────────────

    pub(crate) fn set_stream_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::Relaxed);
    }

    pub(crate) fn set_log_active(&self, active: bool) {
        self.log_active.store(active, Ordering::Relaxed);
    }

    /// Whether the stream channel is currently delivering frames.
    #[must_use]
    pub fn is_watched(&self) -> bool {
        self.stream_active.load(Ordering::Relaxed)
    }

    /// Whether the log channel is currently delivering frames.
    #[must_use]
    pub fn is_logged(&self) -> bool {
        self.log_active.load(Ordering::Relaxed)
    }

    /// Name of the current (or most recent) log file; empty when none.
    #[must_use]
    pub fn log_file_name(&self) -> String {
        self.log_file.lock().clone()
    }

    pub(crate) fn set_logger(&self, logger: Arc<BinaryLogger>) {
        *self.log_file.lock() = logger.file_name().to_string();
        *self.logger.lock() = Some(logger);
    }

    pub(crate) fn logger(&self) -> Option<Arc<BinaryLogger>> {
        self.logger.lock().clone()
    }

    pub(crate) fn take_logger(&self) -> Option<Arc<BinaryLogger>> {
        self.logger.lock().take()
    }
}

/// A typed watched variable, held by application code.
///
/// `set` goes through the manager (threaded explicitly, the way the audio
/// callback already threads its context); `get` is free-standing and
/// resolves the local/remote split on its own.
pub struct Watched<T: WatchKind> {
    pub(crate) local: T,
    pub(crate) shared: Arc<VarShared>,
    pub(crate) handle: VarHandle,
}

impl<T: WatchKind> Watched<T> {
    pub(crate) fn new(shared: Arc<VarShared>, handle: VarHandle) -> Self {
        Self {
            local: T::default(),
            shared,
            handle,
        }
    }

    /// The manager handle for this variable.
    #[must_use]
    pub fn handle(&self) -> VarHandle {
        self.handle
    }

    /// The variable's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// The effective value: local under local control, else the
    /// host-supplied remote value.
    #[must_use]
    pub fn get(&self) -> T {
        if self.shared.has_local_control() {
            self.local
        } else {
            T::from_bits64(self.shared.remote_bits())
        }
    }

    /// The last locally-assigned value, ignoring remote control.
    #[must_use]
    pub fn local_value(&self) -> T {
        self.local
    }

    /// Enables or disables local control (see [`VarShared::set_local_control`]).
    pub fn local_control(&self, enable: bool) {
        self.shared.set_local_control(enable);
    }

    /// Masked remote write; integer kinds only.
    pub fn set_mask(&self, value: f64, mask: u32) -> WatchResult<()> {
        self.shared.set_remote_masked(value, mask)
    }

    /// The shared control-plane cell.
    #[must_use]
    pub fn shared(&self) -> &Arc<VarShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(kind: ValueKind) -> VarShared {
        VarShared::new("v".into(), kind, TimestampMode::Block, 0)
    }

    #[test]
    fn get_follows_local_control() {
        let s = shared(ValueKind::F32);
        s.store_local(7.0f32.to_bits() as u64);
        s.set_remote(42.0);

        assert_eq!(s.value_f64(), 7.0);
        s.set_local_control(false);
        assert_eq!(s.value_f64(), 42.0);
        s.set_local_control(true);
        assert_eq!(s.value_f64(), 7.0);
    }

    #[test]
    fn disabling_local_control_seeds_remote_from_local() {
        let s = shared(ValueKind::I32);
        s.store_local((-3i32).to_bits64());
        s.set_remote(99.0);

        // Fresh disable: remote snaps to the local value, not the stale 99
        s.set_local_control(true);
        s.set_local_control(false);
        assert_eq!(s.value_f64(), -3.0);
    }

    #[test]
    fn controlling_toggles_local_control_once() {
        let s = shared(ValueKind::U32);
        s.start_controlling();
        assert!(s.is_controlled());
        assert!(!s.has_local_control());

        // Second control command is a no-op
        s.start_controlling();
        assert!(!s.has_local_control());

        s.stop_controlling();
        assert!(!s.is_controlled());
        assert!(s.has_local_control());
    }

    #[test]
    fn set_mask_clears_then_ors() {
        let s = shared(ValueKind::U32);
        s.set_remote(0b1111_0000 as f64);
        s.set_remote_masked(0b0000_1010 as f64, 0b0000_1111).unwrap();
        assert_eq!(s.remote_bits(), 0b1111_1010);
    }

    #[test]
    fn set_mask_rejects_float_kinds() {
        let s = shared(ValueKind::F64);
        let err = s.set_remote_masked(1.0, 0xff).unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
    }

    #[test]
    fn monitor_change_flag_round_trip() {
        let s = shared(ValueKind::F32);
        s.set_monitor_period(5);
        assert_eq!(s.monitor_period(), 5);
        assert_ne!(s.monitoring_raw() & MONITOR_CHANGE, 0);
        s.clear_monitor_change();
        assert_eq!(s.monitoring_raw(), 5);
    }
}
