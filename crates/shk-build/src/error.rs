//! Error types for the build engine.

use thiserror::Error;

use crate::session::MAX_MANIFEST_REBUILDS;

/// Errors that abort a build.
///
/// Failing *commands* are not errors; they consume the failure budget and
/// are reported per step. These are the logical and environmental failures
/// of the engine itself.
#[derive(Debug, Error)]
pub enum BuildError {
    // === File system and log ===
    #[error(transparent)]
    Fs(#[from] shk_fs::FsError),

    #[error(transparent)]
    Log(#[from] shk_log::LogError),

    // === Graph errors ===
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("more than one build step declares output '{0}'")]
    DuplicateOutput(String),

    #[error("dependency cycle: {0}")]
    Cycle(String),

    // === Scheduling ===
    #[error("manifest did not stabilize after {MAX_MANIFEST_REBUILDS} rebuild cycles")]
    ManifestRebuildLoop,
}

pub type Result<T> = std::result::Result<T, BuildError>;
