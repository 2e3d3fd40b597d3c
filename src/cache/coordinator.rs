//! Cross-process cache directory coordination
//!
//! At most one process instance may own a cache directory at a time. Ownership
//! is an exclusive advisory lock on the sibling file `<dir>.lock`, taken once
//! and held until `dispose` (or drop). Contention is a `false` result, never
//! an error.

use super::fs::{FileLock, FileSystem};
use crate::error::CacheError;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct CoordinatorState {
    lock: Option<FileLock>,
    disposed: bool,
}

pub struct CacheCoordinator {
    cache_dir: PathBuf,
    lock_path: PathBuf,
    fs: Arc<dyn FileSystem>,
    state: Mutex<CoordinatorState>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("cache_dir", &self.cache_dir)
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl CacheCoordinator {
    pub fn new(cache_dir: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        let cache_dir = cache_dir.into();
        let lock_path = lock_path_for(&cache_dir);
        CacheCoordinator {
            cache_dir,
            lock_path,
            fs,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take ownership of the cache directory.
    ///
    /// Idempotent once held. Returns `Ok(false)` when another holder has the
    /// lock or this coordinator was disposed. Only I/O failures unrelated to
    /// contention are errors.
    pub fn try_acquire(&self) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Ok(false);
        }
        if state.lock.is_some() {
            return Ok(true);
        }

        self.fs
            .create_dir_all(&self.cache_dir)
            .map_err(|e| CacheError::io(self.cache_dir.display().to_string(), e))?;

        match self.fs.try_lock_exclusive(&self.lock_path) {
            Ok(Some(lock)) => {
                info!(path = %self.cache_dir.display(), "Acquired cache directory");
                state.lock = Some(lock);
                Ok(true)
            }
            Ok(None) => {
                debug!(path = %self.lock_path.display(), "Cache directory held by another instance");
                Ok(false)
            }
            Err(e) => Err(CacheError::io(self.lock_path.display().to_string(), e)),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().lock.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Release the lock if held. Safe to call any number of times.
    pub fn dispose(&self) {
        let released = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.lock.take()
        };
        if released.is_some() {
            debug!(path = %self.lock_path.display(), "Released cache directory");
        }
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// `<dir>.lock`, ignoring any trailing separator on `dir`
fn lock_path_for(cache_dir: &Path) -> PathBuf {
    let mut name: OsString = cache_dir.components().collect::<PathBuf>().into_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fs::{InMemoryFileSystem, LocalFileSystem};

    #[test]
    fn test_lock_path_is_sibling() {
        assert_eq!(
            lock_path_for(Path::new("/var/cache/app/")),
            PathBuf::from("/var/cache/app.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("relative/dir")),
            PathBuf::from("relative/dir.lock")
        );
    }

    #[test]
    fn test_acquire_creates_directory_and_is_idempotent() {
        let fs = InMemoryFileSystem::new();
        let coordinator = CacheCoordinator::new("/app/cache", Arc::new(fs.clone()));

        assert!(coordinator.try_acquire().unwrap());
        assert!(coordinator.try_acquire().unwrap());
        assert!(fs.exists(Path::new("/app/cache")));
        assert!(fs.is_locked(Path::new("/app/cache.lock")));
    }

    #[test]
    fn test_second_coordinator_waits_for_dispose() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let first = CacheCoordinator::new("/app/cache", Arc::clone(&fs));
        let second = CacheCoordinator::new("/app/cache", Arc::clone(&fs));

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());

        first.dispose();
        first.dispose();
        assert!(second.try_acquire().unwrap());
        assert!(!first.try_acquire().unwrap(), "disposed coordinator never reacquires");
    }

    #[test]
    fn test_drop_releases() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        {
            let holder = CacheCoordinator::new("/c", Arc::clone(&fs));
            assert!(holder.try_acquire().unwrap());
        }
        let next = CacheCoordinator::new("/c", fs);
        assert!(next.try_acquire().unwrap());
    }

    #[test]
    fn test_local_contention_on_real_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("cache");
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());

        let first = CacheCoordinator::new(&dir, Arc::clone(&fs));
        let second = CacheCoordinator::new(&dir, Arc::clone(&fs));

        assert!(first.try_acquire().unwrap());
        assert!(dir.is_dir());
        assert!(tmp.path().join("nested").join("cache.lock").exists());
        assert!(!second.try_acquire().unwrap());

        drop(first);
        assert!(second.try_acquire().unwrap());
    }

    #[test]
    fn test_io_failure_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let coordinator = CacheCoordinator::new(blocker.join("cache"), Arc::new(LocalFileSystem));
        assert!(coordinator.try_acquire().is_err());
    }
}
