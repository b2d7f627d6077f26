//! Shared scaffolding for the scheduler tests: a command runner that
//! interprets a tiny command language against the in-memory file system,
//! plus wrappers for asserting capacity and interruption behavior.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use camino::Utf8PathBuf;

use shk_build::{
    BuildGraph, BuildResult, BuildStatus, CommandCallback, CommandResult, CommandRunner, Interrupt,
    Step, TracedFiles, build,
};
use shk_fs::{Clock, FileSystem, Hash, InMemoryFileSystem, Paths};
use shk_log::InMemoryInvocationLog;

/// Build a dummy command that reads `inputs` and writes `outputs`.
///
/// When run, each output receives contents derived from the output name
/// and a digest of all input contents, so [`check_command`] can verify
/// after the fact that the command ran against the current input state.
pub fn construct_command(inputs: &[&str], outputs: &[&str]) -> String {
    format!("dummy read:{} write:{}", inputs.join(","), outputs.join(","))
}

/// Like [`construct_command`], but outputs are written with fixed
/// contents, independent of the inputs. Reruns produce byte-identical
/// outputs; what restat steps need.
pub fn construct_fixed_command(inputs: &[&str], outputs: &[(&str, &str)]) -> String {
    let writes: Vec<String> = outputs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    format!("dummy read:{} writefixed:{}", inputs.join(","), writes.join(","))
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

struct ParsedCommand {
    inputs: Vec<String>,
    outputs: Vec<String>,
    fixed_outputs: Vec<(String, String)>,
}

fn parse_command(command: &str) -> ParsedCommand {
    let mut parsed = ParsedCommand {
        inputs: Vec::new(),
        outputs: Vec::new(),
        fixed_outputs: Vec::new(),
    };
    for word in command.split_whitespace().skip(1) {
        if let Some(list) = word.strip_prefix("read:") {
            parsed.inputs = split_list(list);
        } else if let Some(list) = word.strip_prefix("write:") {
            parsed.outputs = split_list(list);
        } else if let Some(list) = word.strip_prefix("writefixed:") {
            parsed.fixed_outputs = split_list(list)
                .into_iter()
                .filter_map(|pair| {
                    pair.split_once('=')
                        .map(|(name, value)| (name.to_owned(), value.to_owned()))
                })
                .collect();
        }
    }
    parsed
}

fn input_digest(fs: &InMemoryFileSystem, inputs: &[String]) -> Result<String, String> {
    let mut combined = Vec::new();
    for input in inputs {
        match fs.read_file(input.as_str().into()) {
            Ok(contents) => combined.extend(contents),
            Err(_) => return Err(format!("missing input {input}")),
        }
    }
    Ok(Hash::from_bytes(&combined).short_hex())
}

fn expected_output(name: &str, digest: &str) -> String {
    format!("{name}:{digest}")
}

fn execute(fs: &InMemoryFileSystem, command: &str) -> CommandResult {
    let parsed = parse_command(command);
    let digest = match input_digest(fs, &parsed.inputs) {
        Ok(digest) => digest,
        Err(message) => {
            return CommandResult {
                exit_code: 1,
                output: message,
                traced: None,
                interrupted: false,
            };
        }
    };

    let mut written = Vec::new();
    for output in &parsed.outputs {
        fs.write_file(
            output.as_str().into(),
            expected_output(output, &digest).as_bytes(),
        )
        .expect("dummy command failed to write output");
        written.push(Utf8PathBuf::from(output));
    }
    for (output, value) in &parsed.fixed_outputs {
        fs.write_file(output.as_str().into(), value.as_bytes())
            .expect("dummy command failed to write output");
        written.push(Utf8PathBuf::from(output));
    }

    CommandResult {
        exit_code: 0,
        output: String::new(),
        traced: Some(TracedFiles {
            input_files: parsed.inputs.iter().map(Utf8PathBuf::from).collect(),
            output_files: written,
        }),
        interrupted: false,
    }
}

/// Verify that `command`'s outputs exist and match its current inputs.
pub fn check_command(fs: &InMemoryFileSystem, command: &str) -> Result<(), String> {
    let parsed = parse_command(command);
    let digest = input_digest(fs, &parsed.inputs)?;
    for output in &parsed.outputs {
        let actual = fs
            .read_file(output.as_str().into())
            .map_err(|_| format!("missing output {output}"))?;
        let expected = expected_output(output, &digest);
        if actual != expected.as_bytes() {
            return Err(format!("output {output} does not match its inputs"));
        }
    }
    for (output, value) in &parsed.fixed_outputs {
        let actual = fs
            .read_file(output.as_str().into())
            .map_err(|_| format!("missing output {output}"))?;
        if actual != value.as_bytes() {
            return Err(format!("output {output} does not hold its fixed contents"));
        }
    }
    Ok(())
}

/// Interprets dummy commands against an in-memory file system, completing
/// one command per `run_commands` call, in submission order. When the
/// interrupt flag is set, pending commands are cancelled instead.
pub struct DummyCommandRunner {
    fs: InMemoryFileSystem,
    pending: VecDeque<(String, CommandCallback)>,
    pub invoked: Vec<String>,
    interrupt: Option<Interrupt>,
}

impl DummyCommandRunner {
    pub fn new(fs: InMemoryFileSystem) -> Self {
        Self {
            fs,
            pending: VecDeque::new(),
            invoked: Vec::new(),
            interrupt: None,
        }
    }

    pub fn with_interrupt(fs: InMemoryFileSystem, interrupt: Interrupt) -> Self {
        Self {
            interrupt: Some(interrupt),
            ..Self::new(fs)
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_set)
    }
}

impl CommandRunner for DummyCommandRunner {
    fn invoke(&mut self, command: String, _pool: &str, on_done: CommandCallback) {
        self.invoked.push(command.clone());
        self.pending.push_back((command, on_done));
    }

    fn size(&self) -> usize {
        self.pending.len()
    }

    fn can_run_more(&self) -> bool {
        true
    }

    async fn run_commands(&mut self) -> bool {
        if self.interrupted() {
            while let Some((_, on_done)) = self.pending.pop_front() {
                on_done(CommandResult::cancelled());
            }
            return true;
        }
        if let Some((command, on_done)) = self.pending.pop_front() {
            on_done(execute(&self.fs, &command));
        }
        self.interrupted()
    }
}

/// Asserts that the runner below never holds more than `max_capacity`
/// commands; catches scheduling that ignores dependency order.
pub struct MaxCapacityRunner<R> {
    max_capacity: usize,
    inner: R,
}

impl<R: CommandRunner> MaxCapacityRunner<R> {
    pub fn new(max_capacity: usize, inner: R) -> Self {
        Self {
            max_capacity,
            inner,
        }
    }
}

impl<R: CommandRunner> CommandRunner for MaxCapacityRunner<R> {
    fn invoke(&mut self, command: String, pool: &str, on_done: CommandCallback) {
        assert!(
            self.inner.size() < self.max_capacity,
            "more than {} commands in flight",
            self.max_capacity
        );
        self.inner.invoke(command, pool, on_done);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    async fn run_commands(&mut self) -> bool {
        self.inner.run_commands().await
    }
}

/// Panics if any command is invoked; for asserting no-op builds.
pub struct FailingCommandRunner;

impl CommandRunner for FailingCommandRunner {
    fn invoke(&mut self, command: String, _pool: &str, _on_done: CommandCallback) {
        panic!("no commands should run, but got: {command}");
    }

    fn size(&self) -> usize {
        0
    }

    fn can_run_more(&self) -> bool {
        true
    }

    async fn run_commands(&mut self) -> bool {
        false
    }
}

/// Counts status events; optionally latches an interrupt after a number
/// of finished steps, like a user watching progress and hitting ^C.
#[derive(Default)]
pub struct CountingStatus {
    pub total: usize,
    pub started: usize,
    pub finished: usize,
    pub interrupt_after: Option<(usize, Interrupt)>,
}

impl BuildStatus for CountingStatus {
    fn build_started(&mut self, total_steps: usize) {
        self.total = total_steps;
    }

    fn step_started(&mut self, _step: &Step) {
        self.started += 1;
    }

    fn step_finished(&mut self, _step: &Step, _success: bool, _output: &str) {
        self.finished += 1;
        if let Some((after, interrupt)) = &self.interrupt_after
            && self.finished >= *after
        {
            interrupt.set();
        }
    }
}

/// One build environment: clock, file system, interner and log shared
/// across successive builds, the way one build directory persists across
/// invocations.
pub struct TestBuild {
    pub time: Arc<AtomicI64>,
    pub clock: Clock,
    pub fs: InMemoryFileSystem,
    pub paths: Paths,
    pub log: InMemoryInvocationLog,
}

impl TestBuild {
    pub fn new() -> Self {
        let time = Arc::new(AtomicI64::new(100));
        let t = time.clone();
        let clock: Clock = Arc::new(move || t.load(Ordering::SeqCst));
        Self {
            time,
            clock: clock.clone(),
            fs: InMemoryFileSystem::new(clock),
            paths: Paths::new(),
            log: InMemoryInvocationLog::new(),
        }
    }

    /// Move the wall clock forward, ending the current racy window.
    pub fn advance_clock(&self) {
        self.time.fetch_add(1, Ordering::SeqCst);
    }

    pub fn runner(&self) -> DummyCommandRunner {
        DummyCommandRunner::new(self.fs.clone())
    }

    /// A step whose command reads `inputs` and writes `outputs`, with the
    /// same files declared.
    pub fn step(&self, inputs: &[&str], outputs: &[&str]) -> Step {
        Step {
            rule: "dummy".to_string(),
            command: construct_command(inputs, outputs),
            inputs: inputs.iter().map(|p| self.paths.get(*p)).collect(),
            outputs: outputs.iter().map(|p| self.paths.get(*p)).collect(),
            ..Step::default()
        }
    }

    pub fn phony(&self, inputs: &[&str], outputs: &[&str]) -> Step {
        Step {
            rule: "phony".to_string(),
            inputs: inputs.iter().map(|p| self.paths.get(*p)).collect(),
            outputs: outputs.iter().map(|p| self.paths.get(*p)).collect(),
            ..Step::default()
        }
    }

    pub fn graph(&self, steps: Vec<Step>) -> BuildGraph {
        BuildGraph {
            steps,
            ..BuildGraph::default()
        }
    }

    pub async fn run(&mut self, graph: &BuildGraph, runner: &mut impl CommandRunner) -> BuildResult {
        self.run_allowing_failures(graph, runner, 1).await
    }

    pub async fn run_allowing_failures(
        &mut self,
        graph: &BuildGraph,
        runner: &mut impl CommandRunner,
        failures_allowed: usize,
    ) -> BuildResult {
        let mut status = CountingStatus::default();
        self.run_with_status(graph, runner, &mut status, failures_allowed)
            .await
    }

    pub async fn run_with_status(
        &mut self,
        graph: &BuildGraph,
        runner: &mut impl CommandRunner,
        status: &mut CountingStatus,
        failures_allowed: usize,
    ) -> BuildResult {
        let invocations = self.log.invocations();
        build(
            &self.clock,
            &self.fs,
            runner,
            status,
            &mut self.log,
            &self.paths,
            failures_allowed,
            true,
            &[],
            graph,
            invocations,
        )
        .await
        .expect("build failed with an engine error")
    }

    pub fn check(&self, command: &str) -> Result<(), String> {
        check_command(&self.fs, command)
    }
}
