//! Centralized error types for the vartap core library.
//!
//! All failures that can cross a module boundary are expressed as
//! [`WatchError`] variants with a machine-readable [`WatchError::code`].
//! Nothing in here ever propagates across the real-time boundary: RT-side
//! code logs and recovers, it never returns an error to the audio callback.

use thiserror::Error;

/// Application-wide error type for the watcher core.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A frame buffer could not be placed so that its value array is
    /// naturally aligned. Surfaced at registration, fatal for that variable.
    #[error("frame buffer for '{0}' cannot be aligned to the value size")]
    AllocationAlignment(String),

    /// A command or inbound frame targets a variable of a different type.
    #[error("type mismatch for '{name}': expected {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        got: String,
    },

    /// The RT thread observed fewer queued messages than the published count.
    #[error("command pipe lost {0} message(s)")]
    PipeOverrun(u64),

    /// A control request is missing required arrays or has mismatched sizes.
    #[error("protocol violation in '{cmd}': {detail}")]
    ProtocolViolation { cmd: String, detail: String },

    /// A named variable is not present in the registry.
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    /// No host is connected; stream sends are silently dropped.
    #[error("no transport client connected")]
    TransportUnavailable,

    /// The binary log writer failed; the log channel returns to quiescent.
    #[error("log writer failed: {0}")]
    LogWriter(#[from] std::io::Error),
}

impl WatchError {
    /// Returns a machine-readable error code for log lines and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllocationAlignment(_) => "allocation_alignment",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::PipeOverrun(_) => "pipe_overrun",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::UnknownVariable(_) => "unknown_variable",
            Self::TransportUnavailable => "transport_unavailable",
            Self::LogWriter(_) => "log_writer_failure",
        }
    }
}

/// Convenient Result alias for core operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_variable_returns_correct_code() {
        let err = WatchError::UnknownVariable("gain".into());
        assert_eq!(err.code(), "unknown_variable");
        assert_eq!(err.to_string(), "unknown variable 'gain'");
    }

    #[test]
    fn io_errors_map_to_log_writer_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = WatchError::from(io);
        assert_eq!(err.code(), "log_writer_failure");
    }
}
