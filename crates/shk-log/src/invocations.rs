//! The in-memory view of the invocation log.

use std::collections::{HashMap, HashSet};

use shk_fingerprint::Fingerprint;
use shk_fs::{Hash, PathId};

/// What one successful command invocation touched.
///
/// Outputs come first, then inputs; within an entry no path appears twice
/// across the two lists. Output fingerprints were taken after the command
/// finished; input fingerprints carry the command's start time, so a file
/// modified while the command ran still fails the stat fast path later.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvocationEntry {
    pub output_files: Vec<(PathId, Fingerprint)>,
    pub input_files: Vec<(PathId, Fingerprint)>,
}

impl InvocationEntry {
    /// All `(path, fingerprint)` pairs, outputs first.
    pub fn all_files(&self) -> impl Iterator<Item = &(PathId, Fingerprint)> {
        self.output_files.iter().chain(self.input_files.iter())
    }
}

/// Everything a previous build left behind: one entry per live command
/// hash, plus the set of directories some build step created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocations {
    pub entries: HashMap<Hash, InvocationEntry>,
    pub created_directories: HashSet<PathId>,
}

impl Invocations {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.created_directories.is_empty()
    }
}
