//! Disk cache: storage abstraction and cross-process ownership

pub mod coordinator;
pub mod fs;

pub use coordinator::CacheCoordinator;
pub use fs::{FileLock, FileSystem, InMemoryFileSystem, LocalFileSystem};
