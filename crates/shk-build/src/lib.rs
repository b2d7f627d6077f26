//! The shuriken build engine: graph, dirty analysis, command execution and
//! scheduling.
//!
//! The flow of a build, in dependency order:
//!
//! 1. The (out-of-scope) manifest parser produces a [`BuildGraph`].
//! 2. [`compute_build`] walks the transitive closure of the requested
//!    targets into a [`Build`]: per-step dependency counts, dependents
//!    lists, and the initially ready frontier.
//! 3. [`compute_clean_steps`] compares recorded fingerprints against the
//!    file system (under a stat cache) and [`discard_clean_steps`] drops
//!    everything that is already up to date.
//! 4. [`build`] drives the remaining dirty steps through a
//!    [`CommandRunner`] stack: [`PooledCommandRunner`] for named pool
//!    capacities over [`LimitedCommandRunner`] for global parallelism and
//!    load, over the process-spawning [`RealCommandRunner`], recording
//!    every completion in the invocation log before dependents unblock.
//!
//! [`BuildSession`] packages the whole sequence, including invocation-log
//! parsing, recompaction, and manifest self-rebuild.

mod build;
mod dirty;
mod error;
mod graph;
mod interrupt;
mod outputs;
mod runner;
mod session;
mod status;

pub use build::{Build, BuildResult, StepNode, build, compute_build, count_steps_to_build};
pub use dirty::{
    CleanSteps, MatchesMemo, StepDirtiness, compute_clean_steps, discard_clean_steps, is_clean,
    outputs_were_changed,
};
pub use error::BuildError;
pub use graph::{
    BuildGraph, Step, StepIndex, compute_output_file_map, compute_step_hashes, root_steps,
    steps_to_build,
};
pub use interrupt::Interrupt;
pub use outputs::{delete_old_outputs, delete_stale_outputs};
pub use runner::limited::{LimitedCommandRunner, LoadSampler, system_load_sampler};
pub use runner::pooled::PooledCommandRunner;
pub use runner::real::RealCommandRunner;
pub use runner::{CommandCallback, CommandResult, CommandRunner, TracedFiles};
pub use session::{BuildSession, MAX_MANIFEST_REBUILDS, SessionOptions};
pub use status::{BuildStatus, TracingBuildStatus};
