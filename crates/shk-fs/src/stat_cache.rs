//! Stat-memoising decorator used during dirty detection.

use std::collections::HashMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::fs::{FileSystem, FsError, Stat};
use crate::hash::Hash;

/// Wraps a file system and memoises `stat` results.
///
/// Dirty detection stats the same files over and over (a popular header is
/// an input to hundreds of steps); this decorator makes each path cost one
/// syscall. The cache is never invalidated, so it must only live for the
/// duration of the dirty-detection phase and be dropped before any command
/// runs; restat checks need fresh data.
pub struct StatCache<F> {
    inner: F,
    cache: Mutex<HashMap<Utf8PathBuf, Stat>>,
}

impl<F: FileSystem> StatCache<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the cache and get the inner file system back.
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: FileSystem> FileSystem for StatCache<F> {
    fn stat(&self, path: &Utf8Path) -> Result<Stat, FsError> {
        if let Some(stat) = self.cache.lock().unwrap().get(path) {
            return Ok(*stat);
        }
        let stat = self.inner.stat(path)?;
        self.cache.lock().unwrap().insert(path.to_owned(), stat);
        Ok(stat)
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        self.inner.read_file(path)
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        self.inner.write_file(path, contents)
    }

    fn append_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        self.inner.append_file(path, contents)
    }

    fn write_atomic(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        self.inner.write_atomic(path, contents)
    }

    fn truncate(&self, path: &Utf8Path, size: u64) -> Result<(), FsError> {
        self.inner.truncate(path, size)
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        self.inner.mkdir(path)
    }

    fn rmdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &Utf8Path) -> Result<(), FsError> {
        self.inner.unlink(path)
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        self.inner.read_dir(path)
    }

    fn hash_file(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        self.inner.hash_file(path)
    }
}
