//! An in-memory [`FileSystem`] for tests and dry runs.
//!
//! Timestamps come from an injected [`Clock`], which lets tests place file
//! modifications and fingerprint captures in the same or different clock
//! seconds deterministically.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::fs::{FileSystem, FsError, Stat};
use crate::hash::Hash;
use crate::paths::normalize_path;
use crate::Clock;

const FILE_MODE: u32 = 0o100644;
const DIR_MODE: u32 = 0o040755;

#[derive(Debug, Clone)]
enum Node {
    File {
        contents: Vec<u8>,
        ino: u64,
        mtime: i64,
        ctime: i64,
    },
    Dir {
        ino: u64,
        mtime: i64,
        ctime: i64,
    },
}

#[derive(Default)]
struct State {
    nodes: HashMap<Utf8PathBuf, Node>,
    next_ino: u64,
}

impl State {
    fn alloc_ino(&mut self) -> u64 {
        self.next_ino += 1;
        self.next_ino
    }
}

/// Memory-backed file system. Clones share the same tree.
#[derive(Clone)]
pub struct InMemoryFileSystem {
    state: Arc<Mutex<State>>,
    clock: Clock,
}

fn is_root(path: &Utf8Path) -> bool {
    matches!(path.as_str(), "" | "." | "/")
}

fn err(path: &Utf8Path, kind: ErrorKind, message: &str) -> FsError {
    FsError::io(path, std::io::Error::new(kind, message.to_string()))
}

impl InMemoryFileSystem {
    pub fn new(clock: Clock) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn parent_is_dir(&self, state: &State, path: &Utf8Path) -> bool {
        match path.parent() {
            None => true,
            Some(parent) if is_root(parent) => true,
            Some(parent) => matches!(state.nodes.get(parent), Some(Node::Dir { .. })),
        }
    }
}

impl FileSystem for InMemoryFileSystem {
    fn stat(&self, path: &Utf8Path) -> Result<Stat, FsError> {
        let path = normalize_path(path);
        if is_root(&path) {
            return Ok(Stat {
                size: 0,
                ino: 0,
                mode: DIR_MODE,
                mtime: 0,
                ctime: 0,
                could_access: true,
            });
        }
        let state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::File {
                contents,
                ino,
                mtime,
                ctime,
            }) => Ok(Stat {
                size: contents.len() as u64,
                ino: *ino,
                mode: FILE_MODE,
                mtime: *mtime,
                ctime: *ctime,
                could_access: true,
            }),
            Some(Node::Dir { ino, mtime, ctime }) => Ok(Stat {
                size: 0,
                ino: *ino,
                mode: DIR_MODE,
                mtime: *mtime,
                ctime: *ctime,
                could_access: true,
            }),
            None => Ok(Stat::absent()),
        }
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        let path = normalize_path(path);
        let state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::File { contents, .. }) => Ok(contents.clone()),
            Some(Node::Dir { .. }) => Err(err(&path, ErrorKind::IsADirectory, "is a directory")),
            None => Err(err(&path, ErrorKind::NotFound, "no such file")),
        }
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        let path = normalize_path(path);
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if !self.parent_is_dir(&state, &path) {
            return Err(err(&path, ErrorKind::NotFound, "parent directory missing"));
        }
        let ino = match state.nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                return Err(err(&path, ErrorKind::IsADirectory, "is a directory"));
            }
            Some(Node::File { ino, .. }) => *ino,
            None => state.alloc_ino(),
        };
        state.nodes.insert(
            path,
            Node::File {
                contents: contents.to_vec(),
                ino,
                mtime: now,
                ctime: now,
            },
        );
        Ok(())
    }

    fn append_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        let path = normalize_path(path);
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if !self.parent_is_dir(&state, &path) {
            return Err(err(&path, ErrorKind::NotFound, "parent directory missing"));
        }
        match state.nodes.get_mut(&path) {
            Some(Node::File {
                contents: existing,
                mtime,
                ctime,
                ..
            }) => {
                existing.extend_from_slice(contents);
                *mtime = now;
                *ctime = now;
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(err(&path, ErrorKind::IsADirectory, "is a directory")),
            None => {
                let ino = state.alloc_ino();
                state.nodes.insert(
                    path,
                    Node::File {
                        contents: contents.to_vec(),
                        ino,
                        mtime: now,
                        ctime: now,
                    },
                );
                Ok(())
            }
        }
    }

    fn write_atomic(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        // A map insert is already atomic from the reader's point of view.
        self.write_file(path, contents)
    }

    fn truncate(&self, path: &Utf8Path, size: u64) -> Result<(), FsError> {
        let path = normalize_path(path);
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        match state.nodes.get_mut(&path) {
            Some(Node::File {
                contents,
                mtime,
                ctime,
                ..
            }) => {
                contents.truncate(size as usize);
                *mtime = now;
                *ctime = now;
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(err(&path, ErrorKind::IsADirectory, "is a directory")),
            None => Err(err(&path, ErrorKind::NotFound, "no such file")),
        }
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        let path = normalize_path(path);
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if state.nodes.contains_key(&path) || is_root(&path) {
            return Err(err(&path, ErrorKind::AlreadyExists, "already exists"));
        }
        if !self.parent_is_dir(&state, &path) {
            return Err(err(&path, ErrorKind::NotFound, "parent directory missing"));
        }
        let ino = state.alloc_ino();
        state.nodes.insert(
            path,
            Node::Dir {
                ino,
                mtime: now,
                ctime: now,
            },
        );
        Ok(())
    }

    fn rmdir(&self, path: &Utf8Path) -> Result<(), FsError> {
        let path = normalize_path(path);
        let mut state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                let occupied = state
                    .nodes
                    .keys()
                    .any(|p| p.parent() == Some(path.as_path()));
                if occupied {
                    return Err(err(&path, ErrorKind::DirectoryNotEmpty, "not empty"));
                }
                state.nodes.remove(&path);
                Ok(())
            }
            Some(Node::File { .. }) => {
                Err(err(&path, ErrorKind::NotADirectory, "not a directory"))
            }
            None => Err(err(&path, ErrorKind::NotFound, "no such directory")),
        }
    }

    fn unlink(&self, path: &Utf8Path) -> Result<(), FsError> {
        let path = normalize_path(path);
        let mut state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(err(&path, ErrorKind::IsADirectory, "is a directory")),
            None => Err(err(&path, ErrorKind::NotFound, "no such file")),
        }
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        let path = normalize_path(path);
        let state = self.state.lock().unwrap();
        if !is_root(&path) && !matches!(state.nodes.get(&path), Some(Node::Dir { .. })) {
            return Err(err(&path, ErrorKind::NotFound, "no such directory"));
        }
        let names = state
            .nodes
            .keys()
            .filter(|p| {
                if is_root(&path) {
                    p.parent().is_none_or(|parent| is_root(parent))
                } else {
                    p.parent() == Some(path.as_path())
                }
            })
            .filter_map(|p| p.file_name().map(str::to_owned))
            .collect();
        Ok(names)
    }

    fn hash_file(&self, path: &Utf8Path) -> Result<Hash, FsError> {
        Ok(Hash::from_bytes(&self.read_file(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fs() -> InMemoryFileSystem {
        InMemoryFileSystem::new(fixed_clock(100))
    }

    #[test]
    fn write_then_stat_and_read() {
        let fs = fs();
        fs.write_file("a".into(), b"hello").unwrap();
        let stat = fs.stat("a".into()).unwrap();
        assert!(stat.could_access);
        assert!(!stat.is_dir());
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mtime, 100);
        assert_eq!(fs.read_file("a".into()).unwrap(), b"hello");
    }

    #[test]
    fn missing_file_is_absent_not_error() {
        let fs = fs();
        assert!(!fs.stat("missing".into()).unwrap().could_access);
        assert!(fs.read_file("missing".into()).unwrap_err().is_not_found());
    }

    #[test]
    fn overwrite_keeps_ino_and_updates_times() {
        let time = Arc::new(AtomicI64::new(1));
        let t = time.clone();
        let fs = InMemoryFileSystem::new(Arc::new(move || t.load(Ordering::SeqCst)));
        fs.write_file("a".into(), b"one").unwrap();
        let before = fs.stat("a".into()).unwrap();
        time.store(2, Ordering::SeqCst);
        fs.write_file("a".into(), b"two").unwrap();
        let after = fs.stat("a".into()).unwrap();
        assert_eq!(before.ino, after.ino);
        assert_eq!(after.mtime, 2);
    }

    #[test]
    fn write_requires_parent_directory() {
        let fs = fs();
        assert!(fs.write_file("dir/a".into(), b"x").is_err());
        fs.mkdir("dir".into()).unwrap();
        fs.write_file("dir/a".into(), b"x").unwrap();
    }

    #[test]
    fn mkdirs_and_read_dir() {
        let fs = fs();
        let created = fs.mkdirs("a/b".into()).unwrap();
        assert_eq!(
            created,
            vec![Utf8PathBuf::from("a"), Utf8PathBuf::from("a/b")]
        );
        fs.write_file("a/b/f".into(), b"").unwrap();
        assert_eq!(fs.read_dir("a/b".into()).unwrap(), vec!["f".to_string()]);
        let mut root = fs.read_dir(".".into()).unwrap();
        root.sort();
        assert_eq!(root, vec!["a".to_string()]);
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let fs = fs();
        fs.mkdir("d".into()).unwrap();
        fs.write_file("d/f".into(), b"").unwrap();
        assert!(fs.rmdir("d".into()).is_err());
        fs.unlink("d/f".into()).unwrap();
        fs.rmdir("d".into()).unwrap();
        assert!(!fs.stat("d".into()).unwrap().could_access);
    }

    #[test]
    fn truncate_shrinks_contents() {
        let fs = fs();
        fs.write_file("f".into(), b"abcdef").unwrap();
        fs.truncate("f".into(), 2).unwrap();
        assert_eq!(fs.read_file("f".into()).unwrap(), b"ab");
    }

    #[test]
    fn hash_file_matches_contents() {
        let fs = fs();
        fs.write_file("f".into(), b"data").unwrap();
        assert_eq!(fs.hash_file("f".into()).unwrap(), Hash::from_bytes(b"data"));
    }
}
