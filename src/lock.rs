//! Advisory lock serializing load-mutate-save across invocations

use crate::error::{Result, RouterError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll interval while another invocation holds the lock
const LOCK_POLL_INTERVAL_MS: u64 = 100;

/// Held exclusive lock; released when dropped
#[derive(Debug)]
pub struct StateLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock, retrying until `timeout` elapses
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RouterError::io("Failed to create", parent, e))?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RouterError::io("Failed to open lock file", path, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match try_lock(&file) {
                Ok(true) => {
                    debug!(path = %path.display(), "Acquired state lock");
                    return Ok(Self {
                        _file: file,
                        path: path.to_path_buf(),
                    });
                }
                Ok(false) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(LOCK_POLL_INTERVAL_MS)).await;
                }
                Ok(false) => {
                    return Err(RouterError::validation(format!(
                        "another n8s invocation holds {} (waited {}s)",
                        path.display(),
                        timeout.as_secs()
                    )));
                }
                Err(e) => return Err(RouterError::io("Failed to lock", path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Non-blocking exclusive flock; `Ok(false)` when held elsewhere
#[cfg(unix)]
fn try_lock(file: &std::fs::File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &std::fs::File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_lock_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state").join("router.conf.lock");

        let lock = StateLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path.as_path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_holder_times_out() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("router.conf.lock");

        let _held = StateLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        let err = StateLock::acquire(&path, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("another n8s invocation"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("router.conf.lock");

        drop(StateLock::acquire(&path, Duration::from_secs(1)).await.unwrap());
        assert!(StateLock::acquire(&path, Duration::from_millis(100)).await.is_ok());
    }
}
