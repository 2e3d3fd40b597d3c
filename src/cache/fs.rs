//! File System Abstraction
//!
//! The coordinator and the durable worker touch disk only through
//! `FileSystem`, so both can be exercised without real I/O.
//!
//! ## Implementations
//!
//! - `LocalFileSystem`: For production (std::fs, advisory `flock`-style locks)
//! - `InMemoryFileSystem`: For unit tests and DST (shared lock table, crash
//!   simulation, injectable write failures)

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs::{OpenOptions, TryLockError};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Temp file written next to the target before the atomic rename
const PARTIAL_EXTENSION: &str = "partial";

/// Exclusive advisory lock. Released when dropped.
pub struct FileLock {
    path: PathBuf,
    _handle: Box<dyn Send + Sync>,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

/// Trait for cache storage backends
pub trait FileSystem: Send + Sync + 'static {
    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> IoResult<()>;
    /// Try to hold `path` exclusively, creating it if needed.
    /// `Ok(None)` means another holder has it.
    fn try_lock_exclusive(&self, path: &Path) -> IoResult<Option<FileLock>>;
    /// Files directly inside `dir` with the given extension, sorted by name.
    fn list_files(&self, dir: &Path, extension: &str) -> IoResult<Vec<PathBuf>>;
    fn read(&self, path: &Path) -> IoResult<Bytes>;
    /// Write a whole file so readers never observe a partial one.
    fn write(&self, path: &Path, data: &[u8]) -> IoResult<()>;
    /// Delete a file. A missing file is not an error.
    fn remove_file(&self, path: &Path) -> IoResult<()>;
    fn exists(&self, path: &Path) -> bool;
}

// ============================================================================
// LocalFileSystem - For production
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        LocalFileSystem
    }
}

impl FileSystem for LocalFileSystem {
    fn create_dir_all(&self, path: &Path) -> IoResult<()> {
        std::fs::create_dir_all(path)
    }

    fn try_lock_exclusive(&self, path: &Path) -> IoResult<Option<FileLock>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(FileLock {
                path: path.to_path_buf(),
                // Closing the handle releases the lock.
                _handle: Box::new(file),
            })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    fn list_files(&self, dir: &Path, extension: &str) -> IoResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &Path) -> IoResult<Bytes> {
        std::fs::read(path).map(Bytes::from)
    }

    fn write(&self, path: &Path, data: &[u8]) -> IoResult<()> {
        let tmp = path.with_extension(PARTIAL_EXTENSION);
        let result = std::fs::File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(data)?;
                file.sync_all()
            })
            .and_then(|()| std::fs::rename(&tmp, path));
        if result.is_err() {
            // The temp file may not exist if create itself failed.
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    fn remove_file(&self, path: &Path) -> IoResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

// ============================================================================
// InMemoryFileSystem - For unit tests and DST
// ============================================================================

#[derive(Debug, Default)]
struct InMemoryState {
    dirs: HashSet<PathBuf>,
    files: BTreeMap<PathBuf, Bytes>,
    locks: HashSet<PathBuf>,
    fail_writes: bool,
}

/// In-memory file system. Clones share the same files and lock table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileSystem {
    state: Arc<Mutex<InMemoryState>>,
}

struct InMemoryLock {
    path: PathBuf,
    state: Arc<Mutex<InMemoryState>>,
}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        self.state.lock().locks.remove(&self.path);
    }
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write` fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Drop every held lock, as if the holding process died
    pub fn simulate_crash(&self) {
        self.state.lock().locks.clear();
    }

    pub fn file_count(&self, dir: &Path) -> usize {
        let state = self.state.lock();
        state
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .count()
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.state.lock().locks.contains(path)
    }
}

impl FileSystem for InMemoryFileSystem {
    fn create_dir_all(&self, path: &Path) -> IoResult<()> {
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn try_lock_exclusive(&self, path: &Path) -> IoResult<Option<FileLock>> {
        let mut state = self.state.lock();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) {
                return Err(IoError::new(
                    ErrorKind::NotFound,
                    format!("parent directory missing: {}", parent.display()),
                ));
            }
        }
        if !state.locks.insert(path.to_path_buf()) {
            return Ok(None);
        }
        Ok(Some(FileLock {
            path: path.to_path_buf(),
            _handle: Box::new(InMemoryLock {
                path: path.to_path_buf(),
                state: Arc::clone(&self.state),
            }),
        }))
    }

    fn list_files(&self, dir: &Path, extension: &str) -> IoResult<Vec<PathBuf>> {
        let state = self.state.lock();
        // BTreeMap keys are already in name order.
        Ok(state
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter(|p| p.extension().is_some_and(|ext| ext == extension))
            .cloned()
            .collect())
    }

    fn read(&self, path: &Path) -> IoResult<Bytes> {
        self.state
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, path.display().to_string()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> IoResult<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(IoError::other("simulated write failure"));
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) => {
                Err(IoError::new(
                    ErrorKind::NotFound,
                    format!("parent directory missing: {}", parent.display()),
                ))
            }
            _ => {
                state
                    .files
                    .insert(path.to_path_buf(), Bytes::copy_from_slice(data));
                Ok(())
            }
        }
    }

    fn remove_file(&self, path: &Path) -> IoResult<()> {
        self.state.lock().files.remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path) || state.dirs.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(fs: &dyn FileSystem, root: &Path) {
        let dir = root.join("cache");
        fs.create_dir_all(&dir).unwrap();
        assert!(fs.exists(&dir));

        fs.write(&dir.join("b.envelope"), b"second").unwrap();
        fs.write(&dir.join("a.envelope"), b"first").unwrap();
        fs.write(&dir.join("c.other"), b"ignored").unwrap();

        let listed = fs.list_files(&dir, "envelope").unwrap();
        assert_eq!(listed, vec![dir.join("a.envelope"), dir.join("b.envelope")]);
        assert_eq!(&fs.read(&dir.join("a.envelope")).unwrap()[..], b"first");

        fs.remove_file(&dir.join("a.envelope")).unwrap();
        fs.remove_file(&dir.join("a.envelope")).unwrap();
        assert!(!fs.exists(&dir.join("a.envelope")));

        let lock_path = root.join("cache.lock");
        let held = fs.try_lock_exclusive(&lock_path).unwrap();
        assert!(held.is_some());
        assert!(fs.try_lock_exclusive(&lock_path).unwrap().is_none());
        drop(held);
        assert!(fs.try_lock_exclusive(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_local_file_system() {
        let tmp = tempfile::tempdir().unwrap();
        exercise(&LocalFileSystem::new(), tmp.path());
    }

    #[test]
    fn test_local_failed_write_leaves_no_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        // Renaming a file over a non-empty directory fails.
        let target = tmp.path().join("busy.envelope");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inner"), b"x").unwrap();

        assert!(LocalFileSystem.write(&target, b"payload").is_err());
        assert!(!tmp.path().join("busy.partial").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn test_in_memory_file_system() {
        exercise(&InMemoryFileSystem::new(), Path::new("/virtual"));
    }

    #[test]
    fn test_local_list_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let listed = LocalFileSystem
            .list_files(&tmp.path().join("nope"), "envelope")
            .unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn test_in_memory_crash_releases_locks_and_keeps_files() {
        let fs = InMemoryFileSystem::new();
        let dir = Path::new("/app/cache");
        fs.create_dir_all(dir).unwrap();
        fs.write(&dir.join("1.envelope"), b"x").unwrap();

        let lock = fs.try_lock_exclusive(Path::new("/app/cache.lock")).unwrap();
        assert!(lock.is_some());
        std::mem::forget(lock);

        fs.simulate_crash();
        assert!(!fs.is_locked(Path::new("/app/cache.lock")));
        assert_eq!(fs.file_count(dir), 1);
    }

    #[test]
    fn test_in_memory_write_failures() {
        let fs = InMemoryFileSystem::new();
        fs.create_dir_all(Path::new("/d")).unwrap();
        fs.set_fail_writes(true);
        assert!(fs.write(Path::new("/d/x.envelope"), b"x").is_err());
        fs.set_fail_writes(false);
        assert!(fs.write(Path::new("/d/x.envelope"), b"x").is_ok());
        assert!(fs.write(Path::new("/missing/x.envelope"), b"x").is_err());
    }
}
