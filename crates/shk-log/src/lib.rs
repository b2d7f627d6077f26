//! The invocation log.
//!
//! Shuriken keeps one record per command it has ever run, together with
//! fingerprints of every file the command read or wrote. The log is what a
//! later build consults to decide that nothing (or only a little) needs to
//! be done, and what `clean` consults to know which outputs it owns. It
//! folds together what ninja splits into a build log and a deps log:
//! shuriken tracks dependencies for every step, so separate files would
//! buy nothing.
//!
//! The pieces:
//!
//! - [`Invocations`]: the parsed, in-memory view of the log.
//! - [`InvocationLog`]: the write-only surface the build uses while
//!   running; implemented by [`InMemoryInvocationLog`] (tests, dry runs)
//!   and [`PersistentInvocationLog`] (the disk-backed one).
//! - [`parse_invocation_log`] / [`open_invocation_log`] /
//!   [`recompact_invocation_log`]: the persistent store.

mod in_memory;
mod invocation_log;
mod invocations;
mod persistent;

pub use in_memory::InMemoryInvocationLog;
pub use invocation_log::InvocationLog;
pub use invocations::{InvocationEntry, Invocations};
pub use persistent::{
    InvocationLogParseResult, LOG_FORMAT_VERSION, PathIds, PersistentInvocationLog,
    invocation_log_path, open_invocation_log, parse_invocation_log, recompact_invocation_log,
};

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors from the invocation log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Fs(#[from] shk_fs::FsError),

    #[error("invocation log {path} has version {found}, expected {expected}")]
    Version {
        path: Utf8PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("invocation log {path}: {message}")]
    Parse { path: Utf8PathBuf, message: String },
}
