//! Advisory file locking
//!
//! Thin RAII wrapper over `flock(2)`. Acquisition is a bounded-wait loop
//! of non-blocking attempts; hitting the deadline raises
//! [`ShmError::LockAcquisition`] instead of hanging a caller forever.
//! Drop unconditionally releases the lock on every exit path.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::ShmError;

/// Poll interval between non-blocking acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared lock, concurrent readers allowed.
    Shared,
    /// Exclusive lock, single holder.
    Exclusive,
}

/// Held advisory lock on a sentinel file. The sentinel carries no data;
/// it exists purely for OS-level locking.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire within `timeout`, polling non-blockingly every 10ms.
    pub fn acquire(
        path: impl AsRef<Path>,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let op = match kind {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;

        let start = Instant::now();
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                return Ok(Self { file, path });
            }

            let err = std::io::Error::last_os_error();
            let retryable = matches!(
                err.raw_os_error(),
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR)
            );
            if !retryable {
                return Err(ShmError::Io(err));
            }
            if start.elapsed() >= timeout {
                return Err(ShmError::LockAcquisition {
                    path: path.display().to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(RETRY_INTERVAL.min(timeout));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            tracing::warn!(
                path = %self.path.display(),
                error = %std::io::Error::last_os_error(),
                "failed to release file lock"
            );
        }
    }
}
