//! File system plumbing shared by the shuriken build engine.
//!
//! This crate provides the pieces that everything else is built on top of:
//!
//! - [`Paths`], an interner mapping canonicalised path strings to dense
//!   [`PathId`]s,
//! - the [`FileSystem`] trait with a real implementation, an in-memory
//!   implementation for tests and dry runs, and a stat-memoising decorator
//!   for the dirty-detection phase,
//! - [`Hash`], the blake3 content digest used for file contents and build
//!   step identities,
//! - [`Clock`], an injectable wall-clock so tests control time.

mod fs;
mod hash;
mod in_memory;
mod paths;
mod stat_cache;

pub use fs::{FileSystem, FsError, RealFileSystem, Stat};
pub use hash::{HASH_BYTES, Hash};
pub use in_memory::InMemoryFileSystem;
pub use paths::{PathId, Paths, normalize_path};
pub use stat_cache::StatCache;

use std::sync::Arc;

/// Wall clock in whole seconds since the Unix epoch.
///
/// Fingerprint capture times are compared against file mtimes/ctimes, so
/// second granularity is all the engine needs. Injected everywhere so tests
/// can pin or advance time deterministically.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A [`Clock`] backed by the system wall clock.
pub fn system_clock() -> Clock {
    Arc::new(|| jiff::Timestamp::now().as_second())
}

/// A [`Clock`] frozen at a fixed instant, for tests.
pub fn fixed_clock(now: i64) -> Clock {
    Arc::new(move || now)
}
