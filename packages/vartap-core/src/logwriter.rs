//! Binary log writer: the durable output of the log channel.
//!
//! One writer per variable per logging session. The file opens with a header
//! record identifying the variable, then carries raw stream frames. The RT
//! thread appends through an internal buffer; flushing and closing happen on
//! the worker, coordinated through an atomic flush-request flag so the two
//! sides never wait on each other outside the brief append/flush critical
//! section.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::ValueKind;

/// Internal write-buffer capacity. Large enough that steady-state appends
/// hit the kernel only every few frames.
const WRITE_BUF_CAPACITY: usize = 64 * 1024;

/// How many suffixed candidates to try before giving up on a unique name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Buffered binary writer for one variable's log channel.
pub struct BinaryLogger {
    file_name: String,
    path: PathBuf,
    /// `None` once closed or after a write failure.
    inner: Mutex<Option<BufWriter<File>>>,
    flush_requested: AtomicBool,
}

impl BinaryLogger {
    /// Creates a fresh log file for `var_name` in `dir` and writes the
    /// header record.
    ///
    /// The file is named `<variable>.bin`; when that name is taken a
    /// numeric suffix is appended so a new session never clobbers an old
    /// recording.
    pub fn create(
        dir: &Path,
        var_name: &str,
        kind: ValueKind,
        manager_id: usize,
    ) -> io::Result<Arc<Self>> {
        let (file_name, path, file) = open_unique(dir, var_name)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUF_CAPACITY, file);
        writer.write_all(&header_record(var_name, kind, manager_id))?;

        Ok(Arc::new(Self {
            file_name,
            path,
            inner: Mutex::new(Some(writer)),
            flush_requested: AtomicBool::new(false),
        }))
    }

    /// The actual file name chosen (may carry a uniqueness suffix).
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Called on the RT thread.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "log writer closed"))?;
        writer.write_all(bytes)
    }

    /// Asks the worker to flush at its next service pass.
    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    /// Flushes if a flush was requested. Called on the worker.
    ///
    /// Returns whether a flush was performed.
    pub fn service_flush(&self) -> io::Result<bool> {
        if !self.flush_requested.swap(false, Ordering::Acquire) {
            return Ok(false);
        }
        if let Some(writer) = self.inner.lock().as_mut() {
            writer.flush()?;
        }
        Ok(true)
    }

    /// Flushes and closes the file. Further appends fail.
    pub fn close(&self) -> io::Result<()> {
        if let Some(mut writer) = self.inner.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Builds the log header record: null-terminated magic, variable name and
/// type code, then the process id and a pointer-sized manager identifier
/// for intra-run correlation, zero-padded to the next 4-byte boundary.
fn header_record(var_name: &str, kind: ValueKind, manager_id: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(32 + var_name.len());
    header.extend_from_slice(b"watcher\0");
    header.extend_from_slice(var_name.as_bytes());
    header.push(0);
    header.extend_from_slice(kind.code().as_bytes());
    header.push(0);
    header.extend_from_slice(&std::process::id().to_ne_bytes());
    header.extend_from_slice(&manager_id.to_ne_bytes());
    while header.len() % 4 != 0 {
        header.push(0);
    }
    header
}

fn open_unique(dir: &Path, var_name: &str) -> io::Result<(String, PathBuf, File)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            format!("{var_name}.bin")
        } else {
            format!("{var_name}_{attempt:04}.bin")
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((candidate, path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free log file name for '{var_name}'"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_identifies_variable_and_type() {
        let dir = tempdir().unwrap();
        let logger = BinaryLogger::create(dir.path(), "gain", ValueKind::F32, 0x1234).unwrap();
        logger.close().unwrap();

        let bytes = std::fs::read(dir.path().join("gain.bin")).unwrap();
        assert!(bytes.starts_with(b"watcher\0gain\0f\0"));
        assert_eq!(bytes.len() % 4, 0);

        let pid_at = b"watcher\0gain\0f\0".len();
        let pid = u32::from_ne_bytes(bytes[pid_at..pid_at + 4].try_into().unwrap());
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn second_session_gets_a_suffixed_name() {
        let dir = tempdir().unwrap();
        let first = BinaryLogger::create(dir.path(), "v", ValueKind::I32, 0).unwrap();
        let second = BinaryLogger::create(dir.path(), "v", ValueKind::I32, 0).unwrap();
        assert_eq!(first.file_name(), "v.bin");
        assert_eq!(second.file_name(), "v_0001.bin");
    }

    #[test]
    fn flush_only_happens_when_requested() {
        let dir = tempdir().unwrap();
        let logger = BinaryLogger::create(dir.path(), "v", ValueKind::F64, 0).unwrap();
        assert!(!logger.service_flush().unwrap());
        logger.request_flush();
        assert!(logger.service_flush().unwrap());
        assert!(!logger.service_flush().unwrap());
    }

    #[test]
    fn append_after_close_fails() {
        let dir = tempdir().unwrap();
        let logger = BinaryLogger::create(dir.path(), "v", ValueKind::Char, 0).unwrap();
        logger.close().unwrap();
        assert!(logger.append(&[0u8; 4]).is_err());
    }

    #[test]
    fn appended_records_land_after_the_header() {
        let dir = tempdir().unwrap();
        let logger = BinaryLogger::create(dir.path(), "v", ValueKind::U32, 7).unwrap();
        logger.append(&[1, 2, 3, 4]).unwrap();
        logger.close().unwrap();

        let bytes = std::fs::read(logger.path()).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &[1, 2, 3, 4]);
    }
}
