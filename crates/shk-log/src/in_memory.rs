//! A memory-backed [`InvocationLog`] for tests and dry runs.

use std::collections::{HashMap, HashSet};

use shk_fs::{Hash, PathId};

use crate::{InvocationEntry, InvocationLog, Invocations, LogError};

/// Log implementation that records everything in memory instead of on
/// disk. Snapshots into [`Invocations`] so a test can feed one build's
/// writes into the next build's dirty analysis.
#[derive(Debug, Default)]
pub struct InMemoryInvocationLog {
    entries: HashMap<Hash, InvocationEntry>,
    created_directories: HashSet<PathId>,
}

impl InMemoryInvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &HashMap<Hash, InvocationEntry> {
        &self.entries
    }

    pub fn created_directories(&self) -> &HashSet<PathId> {
        &self.created_directories
    }

    /// The state this log would parse back to.
    pub fn invocations(&self) -> Invocations {
        Invocations {
            entries: self.entries.clone(),
            created_directories: self.created_directories.clone(),
        }
    }
}

impl InvocationLog for InMemoryInvocationLog {
    fn created_directory(&mut self, path: PathId) -> Result<(), LogError> {
        self.created_directories.insert(path);
        Ok(())
    }

    fn removed_directory(&mut self, path: PathId) -> Result<(), LogError> {
        self.created_directories.remove(&path);
        Ok(())
    }

    fn ran_command(&mut self, command_hash: Hash, entry: InvocationEntry) -> Result<(), LogError> {
        self.entries.insert(command_hash, entry);
        Ok(())
    }

    fn cleaned_command(&mut self, command_hash: Hash) -> Result<(), LogError> {
        self.entries.remove(&command_hash);
        Ok(())
    }
}
