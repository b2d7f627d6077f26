//! Progress reporting surface.
//!
//! The engine reports step lifecycle events through this trait; how they
//! are rendered (plain lines, a TTY status bar) is the front-end's
//! business. The default implementation routes through `tracing`.

use crate::graph::Step;
use shk_fs::Paths;

/// Receives build progress events from the scheduler.
pub trait BuildStatus {
    /// Called once before any step runs, with the number of commands that
    /// will be invoked (phony and clean steps excluded).
    fn build_started(&mut self, total_steps: usize);

    fn step_started(&mut self, step: &Step);

    /// `output` is the command's combined stdout and stderr.
    fn step_finished(&mut self, step: &Step, success: bool, output: &str);
}

/// A [`BuildStatus`] that emits `[n/total] description` progress lines via
/// `tracing`.
pub struct TracingBuildStatus {
    paths: Paths,
    total: usize,
    finished: usize,
}

impl TracingBuildStatus {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            total: 0,
            finished: 0,
        }
    }
}

impl BuildStatus for TracingBuildStatus {
    fn build_started(&mut self, total_steps: usize) {
        self.total = total_steps;
    }

    fn step_started(&mut self, step: &Step) {
        tracing::debug!(command = %step.command, "step started");
    }

    fn step_finished(&mut self, step: &Step, success: bool, output: &str) {
        self.finished += 1;
        let name = step.display_name(&self.paths);
        if success {
            tracing::info!("[{}/{}] {}", self.finished, self.total, name);
        } else {
            tracing::warn!("[{}/{}] FAILED: {}", self.finished, self.total, name);
        }
        if !output.is_empty() {
            tracing::info!("{}", output.trim_end());
        }
    }
}
