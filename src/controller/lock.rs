//! # Lock Manager
//!
//! Serializes sync attempts per resource identity (`<name>-<namespace>`).
//!
//! Two layers:
//! - an in-process map from identity to an async mutex, created lazily and
//!   dropped again once the last holder or waiter is gone
//! - an optional `flock(2)` on `<lock_dir>/<identity>.lock` so that several
//!   controller processes sharing a host (and its temp dir) never sync the
//!   same resource at the same time
//!
//! The lock is released when the returned [`SyncLock`] is dropped, so every
//! exit path of the pipeline (errors, timeouts, cancellation) releases it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock table poisoned")]
    Poisoned,
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock task failed: {0}")]
    Task(String),
}

/// Hands out per-identity mutual exclusion
#[derive(Debug, Default)]
pub struct LockManager {
    locks: LockMap,
    lock_dir: Option<PathBuf>,
}

impl LockManager {
    /// Lock manager that also takes a file lock under `lock_dir` when set
    #[must_use]
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self {
            locks: Arc::default(),
            lock_dir,
        }
    }

    /// Lock manager without cross-process file locks
    #[must_use]
    pub fn in_process() -> Self {
        Self::new(None)
    }

    /// Wait until no other holder exists for `identity`, then take the lock
    pub async fn acquire(&self, identity: &str) -> Result<SyncLock, LockError> {
        let mutex = {
            let mut locks = self.locks.lock().map_err(|_| LockError::Poisoned)?;
            Arc::clone(
                locks
                    .entry(identity.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        // From here on the SyncLock owns cleanup of the map entry, including
        // when the file lock below fails.
        let mut lock = SyncLock {
            identity: identity.to_string(),
            locks: Arc::clone(&self.locks),
            guard: None,
            file: None,
        };
        lock.guard = Some(mutex.lock_owned().await);
        debug!(lock.identity = identity, "acquired in-process sync lock");

        if let Some(dir) = &self.lock_dir {
            lock.file = Some(lock_file(dir, identity).await?);
            debug!(lock.identity = identity, "acquired file lock");
        }

        Ok(lock)
    }

    /// Number of identities currently held or waited on
    #[must_use]
    pub fn active_identities(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

/// Exclusive right to sync one resource identity; released on drop
#[derive(Debug)]
pub struct SyncLock {
    identity: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
    file: Option<std::fs::File>,
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock.
        drop(self.file.take());
        drop(self.guard.take());

        match self.locks.lock() {
            Ok(mut locks) => {
                let unused = locks
                    .get(&self.identity)
                    .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
                if unused {
                    locks.remove(&self.identity);
                }
            }
            Err(_) => warn!(
                lock.identity = self.identity.as_str(),
                "lock table poisoned, entry not cleaned up"
            ),
        }
        debug!(lock.identity = self.identity.as_str(), "released sync lock");
    }
}

async fn lock_file(dir: &Path, identity: &str) -> Result<std::fs::File, LockError> {
    let dir = dir.to_path_buf();
    let path = dir.join(format!("{identity}.lock"));
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir).map_err(|source| LockError::Open {
            path: path.clone(),
            source,
        })?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        flock_exclusive(&file).map_err(|source| LockError::Flock {
            path: path.clone(),
            source,
        })?;
        Ok(file)
    })
    .await
    .map_err(|e| LockError::Task(e.to_string()))?
}

#[cfg(unix)]
fn flock_exclusive(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: `file` is open for the duration of the call, so the raw
        // descriptor is valid; flock(2) does not retain it.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
