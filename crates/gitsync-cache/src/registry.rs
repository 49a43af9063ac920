//! Process-wide table of per-directory locks.
//!
//! Handles for the same directory share one mutex; handles for different
//! directories never contend. The table only holds weak references, so an
//! entry disappears once the last [`CacheLock`] for its path is dropped.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::lock::{DEFAULT_LOCK_TIMEOUT, DirectoryFileLock, lock_file_for};

/// Errors from acquiring a cache lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for the lock on {0}")]
    Timeout(PathBuf),
    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
struct FileLocking {
    timeout: Duration,
}

/// Hands out [`CacheLock`]s keyed by absolute directory path.
#[derive(Debug, Default)]
pub struct CacheLockRegistry {
    locks: DashMap<PathBuf, Weak<Mutex<()>>>,
    file_locking: Option<FileLocking>,
}

impl CacheLockRegistry {
    /// Registry with in-process locking only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose locks also take an `flock` beside the directory, so
    /// separate processes on one host serialize too.
    pub fn with_file_locks(timeout: Option<Duration>) -> Self {
        Self {
            locks: DashMap::new(),
            file_locking: Some(FileLocking {
                timeout: timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
            }),
        }
    }

    /// Returns the lock for `path`, creating it on first use.
    pub fn lock_for(&self, path: &Path) -> CacheLock {
        let key = normalize(path);

        let (mutex, created) = {
            let mut entry = self.locks.entry(key.clone()).or_default();
            match entry.upgrade() {
                Some(existing) => (existing, false),
                None => {
                    let fresh = Arc::new(Mutex::new(()));
                    *entry = Arc::downgrade(&fresh);
                    (fresh, true)
                }
            }
        };

        if created {
            self.prune();
        }

        CacheLock {
            path: key,
            mutex,
            file_locking: self.file_locking,
        }
    }

    /// Number of paths with a live lock handle.
    pub fn live_locks(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Number of entries in the table, live or not.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drops entries whose lock is no longer referenced.
    pub fn prune(&self) {
        self.locks.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// Mutual exclusion for one directory.
///
/// Callers must not re-acquire a lock they already hold on the same thread.
#[derive(Debug, Clone)]
pub struct CacheLock {
    path: PathBuf,
    mutex: Arc<Mutex<()>>,
    file_locking: Option<FileLocking>,
}

/// Held while inside a critical section. The file lock is released before the
/// in-process mutex.
#[derive(Debug)]
pub struct CacheLockGuard<'a> {
    _file: Option<DirectoryFileLock>,
    _mutex: MutexGuard<'a, ()>,
}

impl CacheLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when both handles refer to the same underlying lock.
    pub fn same_lock(&self, other: &CacheLock) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }

    /// Blocks until the lock is held.
    pub fn acquire(&self) -> Result<CacheLockGuard<'_>, LockError> {
        // A panic inside a previous critical section leaves nothing to repair.
        let mutex = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);

        let file = match self.file_locking {
            Some(settings) => {
                let lock_path = lock_file_for(&self.path);
                let lock = DirectoryFileLock::acquire_with_timeout(&lock_path, settings.timeout)
                    .map_err(|source| {
                        if source.kind() == io::ErrorKind::TimedOut {
                            LockError::Timeout(self.path.clone())
                        } else {
                            LockError::Io {
                                path: self.path.clone(),
                                source,
                            }
                        }
                    })?;
                Some(lock)
            }
            None => None,
        };

        Ok(CacheLockGuard {
            _file: file,
            _mutex: mutex,
        })
    }

    /// Runs `f` while holding the lock.
    pub fn with_lock<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        let _guard = self.acquire()?;
        log::debug!("Acquired cache lock for {}", self.path.display());
        f()
    }
}

/// Makes `path` absolute and removes `.`/`..` components without touching
/// the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
