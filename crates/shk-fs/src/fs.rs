//! The file system contract consumed by the build engine.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::hash::Hash;

/// Errors from file system operations.
///
/// A missing file is not an error for [`FileSystem::stat`]; it is reported
/// through [`Stat::could_access`]. Everything else surfaces here with the
/// offending path attached.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("{path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True if the underlying error is "no such file or directory".
    pub fn is_not_found(&self) -> bool {
        let Self::Io { source, .. } = self;
        source.kind() == std::io::ErrorKind::NotFound
    }
}

/// The subset of stat information the engine cares about.
///
/// The device id is deliberately absent: network file systems rewrite it
/// over time, which would make fingerprints spuriously dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub size: u64,
    pub ino: u64,
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
    /// False when the file could not be stat-ed, for example because it
    /// does not exist.
    pub could_access: bool,
}

impl Stat {
    /// A stat result for a path that does not exist.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_dir(&self) -> bool {
        self.could_access && (self.mode & 0o170000) == 0o040000
    }
}

/// File system operations the engine needs.
///
/// All methods take `&self`; implementations carry their own interior
/// mutability (the real file system has none, the in-memory one locks its
/// state). Handles are expected to be cheap to clone.
pub trait FileSystem {
    /// Stat a path. Missing files yield `Stat::absent()`, not an error.
    fn stat(&self, path: &Utf8Path) -> Result<Stat, FsError>;

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError>;

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError>;

    /// Append to a file, creating it if missing. Used by the invocation log
    /// appender; each call is a durability point.
    fn append_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError>;

    /// Write via a temp file in the same directory plus an atomic rename, so
    /// readers never observe a partially written file.
    fn write_atomic(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError>;

    /// Truncate a file to `size` bytes.
    fn truncate(&self, path: &Utf8Path, size: u64) -> Result<(), FsError>;

    fn mkdir(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Utf8Path) -> Result<(), FsError>;

    fn unlink(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// Names of the entries in a directory, unsorted.
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError>;

    /// Content hash of a regular file.
    fn hash_file(&self, path: &Utf8Path) -> Result<Hash, FsError>;

    /// Hash of a directory's sorted listing. Directories that appear as
    /// build inputs or outputs are fingerprinted by name set, not contents.
    fn hash_dir(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        let mut names = self.read_dir(path)?;
        names.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        for name in &names {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }
        Ok(hasher.finalize().into())
    }

    /// Create a directory and any missing parents, treating already-present
    /// directories as success. Returns the directories that were actually
    /// created, shallowest first, so the caller can record them in the
    /// invocation log.
    fn mkdirs(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, FsError> {
        let mut created = Vec::new();
        let mut prefix = Utf8PathBuf::new();
        for component in path.components() {
            prefix.push(component);
            let stat = self.stat(&prefix)?;
            if stat.could_access {
                if !stat.is_dir() {
                    return Err(FsError::io(
                        prefix.clone(),
                        std::io::Error::new(
                            std::io::ErrorKind::NotADirectory,
                            "not a directory",
                        ),
                    ));
                }
                continue;
            }
            self.mkdir(&prefix)?;
            created.push(prefix.clone());
        }
        Ok(created)
    }
}

impl<F: FileSystem + ?Sized> FileSystem for &F {
    fn stat(&self, path: &Utf8Path) -> Result<Stat, FsError> {
        (**self).stat(path)
    }
    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        (**self).read_file(path)
    }
    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        (**self).write_file(path, contents)
    }
    fn append_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        (**self).append_file(path, contents)
    }
    fn write_atomic(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        (**self).write_atomic(path, contents)
    }
    fn truncate(&self, path: &Utf8Path, size: u64) -> Result<(), FsError> {
        (**self).truncate(path, size)
    }
    fn mkdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        (**self).mkdir(path)
    }
    fn rmdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        (**self).rmdir(path)
    }
    fn unlink(&self, path: &Utf8Path) -> Result<(), FsError> {
        (**self).unlink(path)
    }
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        (**self).read_dir(path)
    }
    fn hash_file(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        (**self).hash_file(path)
    }
    fn hash_dir(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        (**self).hash_dir(path)
    }
    fn mkdirs(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, FsError> {
        (**self).mkdirs(path)
    }
}

/// The OS-backed file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &Utf8Path) -> Result<Stat, FsError> {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path.as_std_path()) {
            Ok(meta) => Ok(Stat {
                size: meta.size(),
                ino: meta.ino(),
                mode: meta.mode(),
                mtime: meta.mtime(),
                ctime: meta.ctime(),
                could_access: true,
            }),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                Ok(Stat::absent())
            }
            Err(err) => Err(FsError::io(path, err)),
        }
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        std::fs::read(path.as_std_path()).map_err(|e| FsError::io(path, e))
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        std::fs::write(path.as_std_path(), contents).map_err(|e| FsError::io(path, e))
    }

    fn append_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|e| FsError::io(path, e))?;
        file.write_all(contents).map_err(|e| FsError::io(path, e))?;
        file.flush().map_err(|e| FsError::io(path, e))
    }

    fn write_atomic(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        use std::io::Write;
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent.as_std_path())
            .map_err(|e| FsError::io(path, e))?;
        let (mut file, temp_path) = temp.into_parts();
        file.write_all(contents).map_err(|e| FsError::io(path, e))?;
        file.sync_all().map_err(|e| FsError::io(path, e))?;
        drop(file);
        temp_path.persist(path.as_std_path()).map_err(|e| {
            FsError::io(path, std::io::Error::other(format!("persist failed: {e}")))
        })?;
        Ok(())
    }

    fn truncate(&self, path: &Utf8Path, size: u64) -> Result<(), FsError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path.as_std_path())
            .map_err(|e| FsError::io(path, e))?;
        file.set_len(size).map_err(|e| FsError::io(path, e))
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        std::fs::create_dir(path.as_std_path()).map_err(|e| FsError::io(path, e))
    }

    fn rmdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        std::fs::remove_dir(path.as_std_path()).map_err(|e| FsError::io(path, e))
    }

    fn unlink(&self, path: &Utf8Path) -> Result<(), FsError> {
        std::fs::remove_file(path.as_std_path()).map_err(|e| FsError::io(path, e))
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        let entries = std::fs::read_dir(path.as_std_path()).map_err(|e| FsError::io(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn hash_file(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        let mut file = std::fs::File::open(path.as_std_path()).map_err(|e| FsError::io(path, e))?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| FsError::io(path, e))?;
        Ok(hasher.finalize().into())
    }
}
