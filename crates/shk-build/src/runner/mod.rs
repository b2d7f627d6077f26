//! Command execution.
//!
//! A [`CommandRunner`] is a small capability set (submit, count, admit,
//! drain) composed by ownership into a stack: pool bookkeeping outside,
//! parallelism and load limiting in the middle, process spawning at the
//! leaf. The scheduler only ever talks to the outermost runner.

pub mod limited;
pub mod pooled;
pub mod real;

use camino::Utf8PathBuf;

/// The files a command was observed touching, as reported by a tracing
/// runner (the `shk-trace` integration point). Without a tracer the
/// scheduler falls back to the step's declared inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracedFiles {
    pub input_files: Vec<Utf8PathBuf>,
    pub output_files: Vec<Utf8PathBuf>,
}

/// The outcome of one command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Process exit code; zero is success.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
    /// Observed reads and writes, when a tracer was attached.
    pub traced: Option<TracedFiles>,
    /// True if the command was terminated because the user interrupted the
    /// build. Interrupted commands are never recorded in the log.
    pub interrupted: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.interrupted
    }

    /// Result for a command that was cancelled before or while running.
    pub fn cancelled() -> Self {
        Self {
            exit_code: -1,
            interrupted: true,
            ..Self::default()
        }
    }
}

/// Completion callback; invoked exactly once, always from within a
/// [`CommandRunner::run_commands`] call on the coordinator, never
/// re-entrantly from `invoke`.
pub type CommandCallback = Box<dyn FnOnce(CommandResult) + Send>;

/// Capability set for invoking build commands.
///
/// Runners compose statically (decorators are generic over their inner
/// runner), so the futures returned here never need to be boxed.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Submit a command for execution in the named pool. `""` is the
    /// unlimited default pool.
    fn invoke(&mut self, command: String, pool: &str, on_done: CommandCallback);

    /// Number of submitted-but-not-completed commands, including any that
    /// a decorator is holding back.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Admission predicate: may the caller submit another command right
    /// now?
    fn can_run_more(&self) -> bool;

    /// Wait until at least one command completes and invoke the callbacks
    /// of everything that finished. Returns immediately when nothing is
    /// pending. The returned flag is true iff the user has requested an
    /// interruption; the caller must then stop submitting.
    async fn run_commands(&mut self) -> bool;
}
