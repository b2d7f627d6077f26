//! The write-only log surface used while a build runs.

use shk_fs::{Hash, PathId};

use crate::{InvocationEntry, LogError};

/// Writes to the invocation log.
///
/// Reading happens separately, before the build, via
/// [`crate::parse_invocation_log`]. Implementations are used by a single
/// writer (the scheduler's bookkeeping runs on the coordinator); exclusive
/// access to the underlying file is the caller's responsibility.
pub trait InvocationLog {
    /// Record that the build created a directory that did not previously
    /// exist.
    fn created_directory(&mut self, path: PathId) -> Result<(), LogError>;

    /// Tombstone a previously recorded created directory.
    fn removed_directory(&mut self, path: PathId) -> Result<(), LogError>;

    /// Record a successful command. Supersedes any previous entry with the
    /// same command hash.
    fn ran_command(&mut self, command_hash: Hash, entry: InvocationEntry) -> Result<(), LogError>;

    /// Tombstone the entry for a command hash, if one is live.
    fn cleaned_command(&mut self, command_hash: Hash) -> Result<(), LogError>;
}
