//! Build state computation and the scheduling loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use shk_fingerprint::take_fingerprint;
use shk_fs::{Clock, FileSystem, PathId, Paths, StatCache};
use shk_log::{InvocationEntry, InvocationLog, Invocations};

use crate::dirty::{
    CleanSteps, MatchesMemo, compute_clean_steps, discard_clean_steps, is_clean,
    outputs_were_changed,
};
use crate::error::{BuildError, Result};
use crate::graph::{
    BuildGraph, StepHashes, StepIndex, compute_output_file_map, compute_step_hashes,
    steps_to_build,
};
use crate::outputs::{delete_old_outputs, delete_stale_outputs};
use crate::runner::{CommandResult, CommandRunner};
use crate::status::BuildStatus;

/// Per-step scheduling state.
#[derive(Debug, Clone, Default)]
pub struct StepNode {
    /// True if the step is in the transitive closure of the requested
    /// targets.
    pub should_build: bool,
    /// Number of producing steps that have not yet completed.
    pub dependencies: usize,
    /// Steps waiting on this one.
    pub dependents: Vec<StepIndex>,
}

/// The mutable state the scheduler drives to completion.
#[derive(Debug, Default)]
pub struct Build {
    pub step_nodes: Vec<StepNode>,
    /// Steps whose dependencies are all satisfied, in step-index order.
    pub ready_steps: Vec<StepIndex>,
    /// Failures still tolerated before the build stops submitting new
    /// work. Zero means unlimited.
    pub remaining_failures: usize,
}

/// Outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    /// Everything was already up to date; no command ran.
    NoWorkToDo,
    Success,
    Failure { failed_steps: usize },
    /// The user interrupted; in-flight work was drained and recorded.
    Interrupted,
}

impl BuildResult {
    /// Process exit code: 0 for a clean outcome, 1 for a build failure,
    /// 2 to distinguish a user interrupt from an ordinary failure.
    pub fn exit_code(self) -> i32 {
        match self {
            BuildResult::NoWorkToDo | BuildResult::Success => 0,
            BuildResult::Failure { .. } => 1,
            BuildResult::Interrupted => 2,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

struct Traversal<'a> {
    graph: &'a BuildGraph,
    paths: &'a Paths,
    step_hashes: &'a StepHashes,
    invocations: &'a Invocations,
    output_file_map: &'a HashMap<PathId, StepIndex>,
    states: Vec<VisitState>,
    nodes: Vec<StepNode>,
    /// Input-path edges on the current DFS stack, for cycle reporting.
    chain: Vec<PathId>,
    entry_depth: Vec<usize>,
}

impl Traversal<'_> {
    fn cycle_error(&self, producer: StepIndex) -> BuildError {
        let cycle = &self.chain[self.entry_depth[producer]..];
        let mut names: Vec<String> = cycle
            .iter()
            .map(|&id| self.paths.resolve(id).into_string())
            .collect();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        BuildError::Cycle(names.join(" -> "))
    }

    fn visit(&mut self, index: StepIndex) -> Result<()> {
        if self.states[index] == VisitState::Done {
            return Ok(());
        }
        self.states[index] = VisitState::InProgress;
        self.entry_depth[index] = self.chain.len();
        self.nodes[index].should_build = true;

        // When a previous invocation is on record, what the step actually
        // read is a better dependency picture than what the manifest
        // declares.
        let dependency_paths: Vec<PathId> =
            if let Some(entry) = self.invocations.entries.get(&self.step_hashes[index]) {
                entry.input_files.iter().map(|&(id, _)| id).collect()
            } else {
                self.graph.steps[index].all_inputs().collect()
            };

        let mut seen_producers = HashSet::new();
        for path in dependency_paths {
            let Some(&producer) = self.output_file_map.get(&path) else {
                continue;
            };
            if !seen_producers.insert(producer) {
                continue;
            }
            match self.states[producer] {
                VisitState::InProgress => {
                    self.chain.push(path);
                    return Err(self.cycle_error(producer));
                }
                VisitState::Unvisited => {
                    self.chain.push(path);
                    self.visit(producer)?;
                    self.chain.pop();
                }
                VisitState::Done => {}
            }
            self.nodes[producer].dependents.push(index);
            self.nodes[index].dependencies += 1;
        }

        self.states[index] = VisitState::Done;
        Ok(())
    }
}

/// Compute the scheduling state for a target set: mark the transitive
/// closure of steps to build, wire up dependency counts and dependents
/// lists, and collect the initially ready frontier. Detects dependency
/// cycles.
pub fn compute_build(
    graph: &BuildGraph,
    paths: &Paths,
    step_hashes: &StepHashes,
    invocations: &Invocations,
    output_file_map: &HashMap<PathId, StepIndex>,
    failures_allowed: usize,
    to_build: &[StepIndex],
) -> Result<Build> {
    let step_count = graph.steps.len();
    let mut traversal = Traversal {
        graph,
        paths,
        step_hashes,
        invocations,
        output_file_map,
        states: vec![VisitState::Unvisited; step_count],
        nodes: vec![StepNode::default(); step_count],
        chain: Vec::new(),
        entry_depth: vec![0; step_count],
    };
    for &index in to_build {
        traversal.visit(index)?;
    }

    let nodes = traversal.nodes;
    let ready_steps = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.should_build && node.dependencies == 0)
        .map(|(index, _)| index)
        .collect();

    Ok(Build {
        step_nodes: nodes,
        ready_steps,
        remaining_failures: failures_allowed,
    })
}

/// Number of commands the build will actually invoke: dirty, non-phony
/// steps in the closure.
pub fn count_steps_to_build(graph: &BuildGraph, clean_steps: &CleanSteps, build: &Build) -> usize {
    build
        .step_nodes
        .iter()
        .enumerate()
        .filter(|&(index, node)| {
            node.should_build && !graph.steps[index].is_phony() && !clean_steps[index].is_clean()
        })
        .count()
}

fn unblock_dependents(
    nodes: &mut [StepNode],
    possibly_clean: &mut [bool],
    ready: &mut VecDeque<StepIndex>,
    index: StepIndex,
    mark_possibly_clean: bool,
) {
    let dependents = nodes[index].dependents.clone();
    for dependent in dependents {
        if mark_possibly_clean {
            possibly_clean[dependent] = true;
        }
        let node = &mut nodes[dependent];
        node.dependencies -= 1;
        if node.dependencies == 0 && node.should_build {
            ready.push_back(dependent);
        }
    }
}

/// Run a build to completion.
///
/// The coordinator is single-threaded: it dispatches ready steps while the
/// runner admits more, then parks in `run_commands`, the only suspension
/// point, and does all bookkeeping (fingerprinting, log appends,
/// unblocking) between completions. An invocation record is durable before
/// any dependent is scheduled.
#[allow(clippy::too_many_arguments)]
pub async fn build(
    clock: &Clock,
    fs: &impl FileSystem,
    runner: &mut impl CommandRunner,
    status: &mut (impl BuildStatus + ?Sized),
    log: &mut dyn InvocationLog,
    paths: &Paths,
    failures_allowed: usize,
    use_stat_cache: bool,
    specified_outputs: &[PathId],
    graph: &BuildGraph,
    mut invocations: Invocations,
) -> Result<BuildResult> {
    let output_file_map = compute_output_file_map(&graph.steps, paths)?;
    let step_hashes = compute_step_hashes(&graph.steps, paths);

    delete_stale_outputs(fs, &mut invocations, log, paths, &step_hashes)?;

    let to_build = steps_to_build(graph, &output_file_map, paths, specified_outputs)?;
    let mut build_state = compute_build(
        graph,
        paths,
        &step_hashes,
        &invocations,
        &output_file_map,
        failures_allowed,
        &to_build,
    )?;

    // Dirty detection runs under a stat cache; the cache dies here, before
    // any command can invalidate it.
    let clean_steps = if use_stat_cache {
        let cached = StatCache::new(fs);
        compute_clean_steps(
            clock,
            &cached,
            log,
            paths,
            &invocations,
            &step_hashes,
            &build_state,
        )?
    } else {
        compute_clean_steps(clock, fs, log, paths, &invocations, &step_hashes, &build_state)?
    };
    let discarded = discard_clean_steps(&clean_steps, &mut build_state);
    debug!(discarded, "clean steps discarded");

    let total_commands = count_steps_to_build(graph, &clean_steps, &build_state);
    if total_commands == 0 {
        return Ok(BuildResult::NoWorkToDo);
    }
    status.build_started(total_commands);

    let step_count = graph.steps.len();
    let mut ready: VecDeque<StepIndex> = build_state.ready_steps.drain(..).collect();
    let mut possibly_clean = vec![false; step_count];
    let mut memo = MatchesMemo::new();
    let mut failed_steps = 0usize;
    let mut stop_submitting = false;
    let mut interrupted = false;
    let mut commands_started = false;

    type Completion = (StepIndex, i64, CommandResult);
    let completions: Arc<Mutex<Vec<Completion>>> = Arc::new(Mutex::new(Vec::new()));

    loop {
        // Dispatch phase: drain the ready frontier. Phony steps and
        // re-confirmed clean steps complete inline; real dirty steps go to
        // the runner while it admits more.
        while !stop_submitting && !interrupted {
            let Some(index) = ready.pop_front() else {
                break;
            };
            let step = &graph.steps[index];

            if step.is_phony() {
                let propagate = possibly_clean[index];
                unblock_dependents(
                    &mut build_state.step_nodes,
                    &mut possibly_clean,
                    &mut ready,
                    index,
                    propagate,
                );
                continue;
            }

            if possibly_clean[index] {
                // Upstream restat output turned out unchanged; this step
                // may not need to run after all.
                if is_clean(
                    clock,
                    fs,
                    log,
                    &mut memo,
                    paths,
                    &invocations,
                    step_hashes[index],
                )? {
                    debug!(step = index, "restat pruned");
                    unblock_dependents(
                        &mut build_state.step_nodes,
                        &mut possibly_clean,
                        &mut ready,
                        index,
                        true,
                    );
                    continue;
                }
                possibly_clean[index] = false;
            }

            if !runner.can_run_more() {
                ready.push_front(index);
                break;
            }

            delete_old_outputs(fs, &mut invocations, log, paths, step_hashes[index])?;
            for &output in &step.outputs {
                let path = paths.resolve(output);
                if let Some(parent) = path.parent()
                    && !parent.as_str().is_empty()
                {
                    for created in fs.mkdirs(parent)? {
                        let dir = paths.get(&created);
                        log.created_directory(dir)?;
                        invocations.created_directories.insert(dir);
                    }
                }
            }

            let invoke_time = clock();
            status.step_started(step);
            commands_started = true;
            let sink = completions.clone();
            runner.invoke(
                step.command.clone(),
                &step.pool,
                Box::new(move |result| {
                    sink.lock().unwrap().push((index, invoke_time, result));
                }),
            );
        }

        if runner.is_empty() {
            if !ready.is_empty() && !stop_submitting && !interrupted {
                // The runner is idle yet admits nothing; a zero-capacity
                // configuration. Bail out instead of spinning.
                warn!("command runner admits no work while idle; giving up");
            }
            break;
        }

        if runner.run_commands().await {
            interrupted = true;
        }

        let completed: Vec<Completion> = completions.lock().unwrap().drain(..).collect();
        for (index, invoke_time, result) in completed {
            let step = &graph.steps[index];

            if result.interrupted {
                status.step_finished(step, false, &result.output);
                continue;
            }

            if !result.success() {
                failed_steps += 1;
                status.step_finished(step, false, &result.output);
                if build_state.remaining_failures > 0 {
                    build_state.remaining_failures -= 1;
                    if build_state.remaining_failures == 0 {
                        stop_submitting = true;
                    }
                }
                // Dependents of a failed step are never scheduled.
                continue;
            }

            let hash = step_hashes[index];

            // For restat steps, compare the previous record against what is
            // on disk now, before the new entry replaces it.
            let restat_unchanged =
                step.restat && !outputs_were_changed(fs, paths, &invocations, hash)?;

            // Output set: declared outputs plus anything the tracer saw the
            // command write. Inputs: the traced read set, or the declared
            // dirtiness-relevant inputs when no tracer is attached.
            let mut output_ids: Vec<PathId> = Vec::new();
            let mut seen: HashSet<PathId> = HashSet::new();
            for &id in &step.outputs {
                if seen.insert(id) {
                    output_ids.push(id);
                }
            }
            let mut input_ids: Vec<PathId> = Vec::new();
            match &result.traced {
                Some(traced) => {
                    for path in &traced.output_files {
                        let id = paths.get(path);
                        if seen.insert(id) {
                            output_ids.push(id);
                        }
                    }
                    for path in &traced.input_files {
                        let id = paths.get(path);
                        if seen.insert(id) {
                            input_ids.push(id);
                        }
                    }
                }
                None => {
                    for id in step
                        .inputs
                        .iter()
                        .chain(step.implicit_inputs.iter())
                        .copied()
                    {
                        if seen.insert(id) {
                            input_ids.push(id);
                        }
                    }
                }
            }

            // Outputs are fingerprinted after the command finished; inputs
            // carry the invocation time, so an input edited while the
            // command ran stays inside the racy window and is re-checked
            // by hash on the next build.
            let finished_at = clock();
            let mut entry = InvocationEntry::default();
            for id in output_ids {
                let fingerprint = take_fingerprint(fs, finished_at, &paths.resolve(id))?;
                entry.output_files.push((id, fingerprint));
            }
            for id in input_ids {
                let fingerprint = take_fingerprint(fs, invoke_time, &paths.resolve(id))?;
                entry.input_files.push((id, fingerprint));
            }

            // If this append fails the durable log no longer reflects what
            // ran; there is no safe way to continue.
            log.ran_command(hash, entry.clone())?;
            invocations.entries.insert(hash, entry);

            status.step_finished(step, true, &result.output);
            unblock_dependents(
                &mut build_state.step_nodes,
                &mut possibly_clean,
                &mut ready,
                index,
                restat_unchanged,
            );
        }
    }

    if interrupted {
        return Ok(BuildResult::Interrupted);
    }
    if failed_steps > 0 {
        return Ok(BuildResult::Failure { failed_steps });
    }
    if commands_started {
        Ok(BuildResult::Success)
    } else {
        Ok(BuildResult::NoWorkToDo)
    }
}
