//! The build session: everything between "invoked in a build directory"
//! and "exit code".
//!
//! A session parses the invocation log (recompacting it when the parser
//! says it is mostly dead weight), opens the appender, and runs the
//! scheduler. If the manifest declares itself as a build output, the
//! session first brings the manifest up to date and reloads the graph when
//! it was rebuilt, bounded by [`MAX_MANIFEST_REBUILDS`] cycles.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use shk_fs::{Clock, FileSystem, PathId, Paths};
use shk_log::{
    invocation_log_path, open_invocation_log, parse_invocation_log, recompact_invocation_log,
    InvocationLogParseResult,
};

use crate::build::{BuildResult, build};
use crate::error::{BuildError, Result};
use crate::graph::BuildGraph;
use crate::runner::CommandRunner;
use crate::status::BuildStatus;

/// Cap on manifest reload cycles, to turn a manifest that rebuilds itself
/// differently every time from a livelock into an error.
pub const MAX_MANIFEST_REBUILDS: usize = 100;

/// Tunables for a build session.
pub struct SessionOptions {
    /// Failures tolerated before the build stops submitting (`-k`);
    /// zero means keep going indefinitely.
    pub failures_allowed: usize,
    /// Memoise stat calls during dirty detection. On by default; the
    /// `SHK_STATCACHE` environment variable set to `0` disables it.
    pub use_stat_cache: bool,
    /// Path of the manifest, when the graph may declare it as an output
    /// and the session should handle self-rebuilds.
    pub manifest_path: Option<Utf8PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            failures_allowed: 1,
            use_stat_cache: std::env::var("SHK_STATCACHE").ok().is_none_or(|v| v != "0"),
            manifest_path: None,
        }
    }
}

/// Ties the engine's pieces together for one build directory.
pub struct BuildSession<F> {
    fs: F,
    clock: Clock,
    paths: Paths,
    log_path: Utf8PathBuf,
    options: SessionOptions,
}

impl<F: FileSystem + Clone> BuildSession<F> {
    pub fn new(fs: F, clock: Clock, paths: Paths, build_dir: &Utf8Path, options: SessionOptions) -> Self {
        Self {
            fs,
            clock,
            paths,
            log_path: invocation_log_path(build_dir),
            options,
        }
    }

    fn parse_log(&self) -> Result<InvocationLogParseResult> {
        let mut parsed = parse_invocation_log(&self.fs, &self.paths, &self.log_path)?;
        if let Some(warning) = &parsed.warning {
            warn!("{warning}");
        }
        if parsed.needs_recompaction {
            info!(log = %self.log_path, "recompacting invocation log");
            recompact_invocation_log(&self.fs, &self.paths, &parsed.invocations, &self.log_path)?;
            // Reparse so the appender is seeded from the fresh file.
            parsed = parse_invocation_log(&self.fs, &self.paths, &self.log_path)?;
        }
        Ok(parsed)
    }

    async fn build_once(
        &self,
        graph: &BuildGraph,
        runner: &mut impl CommandRunner,
        status: &mut (impl BuildStatus + ?Sized),
        targets: &[PathId],
    ) -> Result<BuildResult> {
        let parsed = self.parse_log()?;
        let mut log =
            open_invocation_log(self.fs.clone(), self.paths.clone(), &self.log_path, &parsed)?;
        build(
            &self.clock,
            &self.fs,
            runner,
            status,
            &mut log,
            &self.paths,
            self.options.failures_allowed,
            self.options.use_stat_cache,
            targets,
            graph,
            parsed.invocations,
        )
        .await
    }

    /// Load the graph, handle manifest self-rebuilds, then build the
    /// requested targets.
    ///
    /// `load_graph` is the manifest-parser boundary; it is re-invoked
    /// after each manifest rebuild. `make_runner` builds the command
    /// runner stack for a graph (pool capacities come from the manifest).
    pub async fn run<R, S>(
        &self,
        mut load_graph: impl FnMut(&Paths) -> Result<BuildGraph>,
        mut make_runner: impl FnMut(&BuildGraph) -> R,
        status: &mut S,
        targets: &[PathId],
    ) -> Result<BuildResult>
    where
        R: CommandRunner,
        S: BuildStatus + ?Sized,
    {
        for _ in 0..MAX_MANIFEST_REBUILDS {
            let graph = load_graph(&self.paths)?;

            // If the manifest is itself a declared output, bring it up to
            // date first. The graph is stale the moment the manifest's
            // producing step runs, so reload and start over; a NoWorkToDo
            // pass means the graph we hold is current.
            if let Some(manifest_path) = &self.options.manifest_path {
                let manifest_id = self.paths.get(manifest_path);
                let manifest_is_output = graph
                    .steps
                    .iter()
                    .any(|step| step.outputs.contains(&manifest_id));
                if manifest_is_output {
                    let mut runner = make_runner(&graph);
                    let result = self
                        .build_once(&graph, &mut runner, status, &[manifest_id])
                        .await?;
                    match result {
                        BuildResult::Success => {
                            info!("manifest rebuilt; reloading build graph");
                            continue;
                        }
                        BuildResult::NoWorkToDo => {}
                        other => return Ok(other),
                    }
                }
            }

            let mut runner = make_runner(&graph);
            return self.build_once(&graph, &mut runner, status, targets).await;
        }
        Err(BuildError::ManifestRebuildLoop)
    }
}
