use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

/// How long a cache directory's file lock is waited for by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const FIRST_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(500);

/// Returns the lock file guarding `dir`: a hidden sibling named `.{dir}.lock`.
pub fn lock_file_for(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let lock_name = format!(".{}.lock", name);
    match dir.parent() {
        Some(parent) => parent.join(lock_name),
        None => PathBuf::from(lock_name),
    }
}

/// An exclusive `flock` on a cache directory, shared with other processes on
/// the same host. Released when dropped.
#[derive(Debug)]
pub struct DirectoryFileLock {
    file: File,
}

impl DirectoryFileLock {
    /// Polls with doubling intervals until the lock is free. Fails with
    /// `ErrorKind::TimedOut` once `timeout` has passed.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut poll = FIRST_POLL;

        loop {
            if let Some(lock) = Self::try_acquire(lock_path)? {
                return Ok(lock);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("waited {:?} for {}", timeout, lock_path.display()),
                ));
            }
            std::thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    /// `None` while another holder has the lock.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            // A deleted cache takes its lock file along; a lock won on the
            // unlinked file guards nothing.
            Ok(()) if !still_linked(&file, lock_path)? => Ok(None),
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn still_linked(file: &File, lock_path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(lock_path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, lock_path: &Path) -> io::Result<bool> {
    Ok(lock_path.exists())
}

impl Drop for DirectoryFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_lock_file_is_hidden_sibling() {
        assert_eq!(
            lock_file_for(Path::new("/cache/abc123")),
            PathBuf::from("/cache/.abc123.lock")
        );
    }

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("nested").join(".repo.lock");

        let lock = DirectoryFileLock::acquire_with_timeout(&lock_path, DEFAULT_LOCK_TIMEOUT)
            .unwrap();
        assert!(lock_path.exists());
        drop(lock);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join(".repo.lock");

        {
            let _lock = DirectoryFileLock::try_acquire(&lock_path).unwrap().unwrap();
            assert!(DirectoryFileLock::try_acquire(&lock_path).unwrap().is_none());
        }
        assert!(DirectoryFileLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_unlinked_lock_file_is_not_held() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join(".repo.lock");

        let stale = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .unwrap();
        fs::remove_file(&lock_path).unwrap();
        assert!(!still_linked(&stale, &lock_path).unwrap());

        let lock = DirectoryFileLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(still_linked(&lock.file, &lock_path).unwrap());
    }

    #[test]
    fn test_acquire_with_timeout_times_out() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join(".repo.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let holder_path = Arc::clone(&lock_path);
        let holder_barrier = Arc::clone(&barrier);
        let holder = thread::spawn(move || {
            let lock = DirectoryFileLock::try_acquire(&holder_path).unwrap().unwrap();
            holder_barrier.wait();
            thread::sleep(Duration::from_millis(400));
            drop(lock);
        });

        barrier.wait();
        let err = DirectoryFileLock::acquire_with_timeout(&lock_path, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        holder.join().unwrap();
    }
}
