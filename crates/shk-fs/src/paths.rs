//! Path interning.
//!
//! Every component of the engine refers to files by [`PathId`] rather than
//! by string. Two ids are equal iff the lexically normalised path strings
//! are equal. Ids are dense, cheap to copy and hash, stable within a
//! process, and never persisted (the invocation log assigns its own record
//! numbers).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Dense id assigned to an interned path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub u32);

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathId({})", self.0)
    }
}

#[derive(Default)]
struct PathsInner {
    by_path: HashMap<Utf8PathBuf, PathId>,
    strings: Vec<Utf8PathBuf>,
}

/// The path interner. Cheap to clone; clones share the same table.
///
/// Logically shared but single-writer: only the build coordinator interns
/// new paths.
#[derive(Clone, Default)]
pub struct Paths {
    inner: Arc<RwLock<PathsInner>>,
}

impl Paths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a path, normalising it first. Returns the existing id if the
    /// normalised string has been seen before.
    pub fn get(&self, path: impl AsRef<Utf8Path>) -> PathId {
        let normalized = normalize_path(path.as_ref());
        {
            let inner = self.inner.read().expect("paths lock poisoned");
            if let Some(&id) = inner.by_path.get(&normalized) {
                return id;
            }
        }
        let mut inner = self.inner.write().expect("paths lock poisoned");
        // Someone may have interned it between the read and write locks.
        if let Some(&id) = inner.by_path.get(&normalized) {
            return id;
        }
        let id = PathId(inner.strings.len() as u32);
        inner.strings.push(normalized.clone());
        inner.by_path.insert(normalized, id);
        id
    }

    /// The normalised path string for an id.
    ///
    /// Panics if the id was not produced by this interner; ids are only
    /// ever created by [`Paths::get`].
    pub fn resolve(&self, id: PathId) -> Utf8PathBuf {
        let inner = self.inner.read().expect("paths lock poisoned");
        inner.strings[id.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("paths lock poisoned").strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lexically normalise a path: drop `.` components, collapse `a/..` pairs,
/// deduplicate separators. Does not consult the file system, so `..` is
/// only collapsed when a normal component precedes it.
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else {
                    out.push("..");
                }
            }
            other => {
                out.push(other);
                if matches!(other, Utf8Component::Normal(_)) {
                    depth += 1;
                }
            }
        }
    }
    if out.as_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_paths_get_equal_ids() {
        let paths = Paths::new();
        assert_eq!(paths.get("a/b"), paths.get("a/b"));
        assert_ne!(paths.get("a/b"), paths.get("a/c"));
    }

    #[test]
    fn normalisation_unifies_spellings() {
        let paths = Paths::new();
        assert_eq!(paths.get("a/b"), paths.get("./a/b"));
        assert_eq!(paths.get("a/b"), paths.get("a//b"));
        assert_eq!(paths.get("a/b"), paths.get("a/x/../b"));
    }

    #[test]
    fn resolve_returns_normalised_string() {
        let paths = Paths::new();
        let id = paths.get("./x//y/../z");
        assert_eq!(paths.resolve(id), Utf8PathBuf::from("x/z"));
    }

    #[test]
    fn normalize_edge_cases() {
        assert_eq!(normalize_path("".into()), Utf8PathBuf::from("."));
        assert_eq!(normalize_path(".".into()), Utf8PathBuf::from("."));
        assert_eq!(normalize_path("../a".into()), Utf8PathBuf::from("../a"));
        assert_eq!(normalize_path("/a/./b".into()), Utf8PathBuf::from("/a/b"));
        assert_eq!(normalize_path("a/..".into()), Utf8PathBuf::from("."));
    }

    #[test]
    fn clones_share_the_table() {
        let paths = Paths::new();
        let id = paths.get("shared");
        let clone = paths.clone();
        assert_eq!(clone.get("shared"), id);
        assert_eq!(clone.len(), 1);
    }
}
