//! Deciding which steps need to run.

use std::collections::HashMap;

use tracing::debug;

use shk_fingerprint::{Fingerprint, MatchesResult, fingerprint_matches, retake_fingerprint};
use shk_fs::{Clock, FileSystem, Hash, PathId, Paths};
use shk_log::{InvocationEntry, InvocationLog, Invocations};

use crate::build::Build;
use crate::error::Result;
use crate::graph::StepHashes;

/// Memo for fingerprint matches.
///
/// The same file commonly appears in many entries with the same recorded
/// fingerprint; each distinct `(path, fingerprint)` pair is checked against
/// the file system once per dirty-detection phase.
pub type MatchesMemo = HashMap<(PathId, Fingerprint), MatchesResult>;

/// Per-step dirtiness verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDirtiness {
    Clean,
    /// Dirty, with the file that triggered it when one is known. A step
    /// with no recorded invocation is dirty with no trigger.
    Dirty(Option<PathId>),
}

impl StepDirtiness {
    pub fn is_clean(&self) -> bool {
        matches!(self, StepDirtiness::Clean)
    }
}

/// One verdict per step, aligned with the graph's step vector. Steps
/// outside the requested closure are never computed and report dirty.
pub type CleanSteps = Vec<StepDirtiness>;

fn check_entry(
    fs: &impl FileSystem,
    memo: &mut MatchesMemo,
    paths: &Paths,
    entry: &InvocationEntry,
) -> Result<(StepDirtiness, bool)> {
    let mut needs_update = false;
    for &(id, fingerprint) in entry.all_files() {
        let result = match memo.get(&(id, fingerprint)) {
            Some(result) => *result,
            None => {
                let result = fingerprint_matches(fs, &paths.resolve(id), &fingerprint)?;
                memo.insert((id, fingerprint), result);
                result
            }
        };
        if !result.clean {
            return Ok((StepDirtiness::Dirty(Some(id)), false));
        }
        needs_update |= result.should_update;
    }
    Ok((StepDirtiness::Clean, needs_update))
}

fn dirtiness(
    clock: &Clock,
    fs: &impl FileSystem,
    log: &mut dyn InvocationLog,
    memo: &mut MatchesMemo,
    paths: &Paths,
    invocations: &Invocations,
    step_hash: Hash,
) -> Result<StepDirtiness> {
    let Some(entry) = invocations.entries.get(&step_hash) else {
        return Ok(StepDirtiness::Dirty(None));
    };

    let (verdict, needs_update) = check_entry(fs, memo, paths, entry)?;

    if verdict.is_clean() && needs_update {
        // The entry is clean, but proving it required hashing: some
        // fingerprint was taken in the same second its file changed.
        // Re-log with fresh fingerprints so the next build takes the
        // stat-only fast path.
        let retake = |files: &[(PathId, Fingerprint)]| -> Result<Vec<(PathId, Fingerprint)>> {
            files
                .iter()
                .map(|&(id, old)| {
                    Ok((id, retake_fingerprint(fs, clock(), &paths.resolve(id), &old)?))
                })
                .collect()
        };
        let refreshed = InvocationEntry {
            output_files: retake(&entry.output_files)?,
            input_files: retake(&entry.input_files)?,
        };
        log.ran_command(step_hash, refreshed)?;
    }

    Ok(verdict)
}

/// Is the recorded invocation for `step_hash` still an accurate picture of
/// the file system? Steps with no recorded invocation are never clean.
///
/// As a side effect, racily-clean entries are re-logged with refreshed
/// fingerprints.
pub fn is_clean(
    clock: &Clock,
    fs: &impl FileSystem,
    log: &mut dyn InvocationLog,
    memo: &mut MatchesMemo,
    paths: &Paths,
    invocations: &Invocations,
    step_hash: Hash,
) -> Result<bool> {
    Ok(dirtiness(clock, fs, log, memo, paths, invocations, step_hash)?.is_clean())
}

/// Compute cleanliness for every step the build intends to run.
///
/// The caller passes a stat-caching file system here; the cache must not
/// outlive this phase.
pub fn compute_clean_steps(
    clock: &Clock,
    fs: &impl FileSystem,
    log: &mut dyn InvocationLog,
    paths: &Paths,
    invocations: &Invocations,
    step_hashes: &StepHashes,
    build: &Build,
) -> Result<CleanSteps> {
    let mut memo = MatchesMemo::new();
    let mut clean_steps = Vec::with_capacity(build.step_nodes.len());
    for (index, node) in build.step_nodes.iter().enumerate() {
        if !node.should_build {
            clean_steps.push(StepDirtiness::Dirty(None));
            continue;
        }
        let verdict = dirtiness(
            clock,
            fs,
            log,
            &mut memo,
            paths,
            invocations,
            step_hashes[index],
        )?;
        if let StepDirtiness::Dirty(Some(trigger)) = &verdict {
            debug!(step = index, path = %paths.resolve(*trigger), "dirty");
        }
        clean_steps.push(verdict);
    }
    Ok(clean_steps)
}

/// Drop clean steps from the build frontier.
///
/// Starting from the initially ready steps, every clean step is discarded
/// and its dependents' dependency counts decremented; dependents that
/// become ready continue the cascade. A dirty step stays in the frontier
/// and blocks the cascade; dirtiness is monotonic up the graph, so
/// anything behind it will be revisited after it reruns. Returns the
/// number of steps discarded.
pub fn discard_clean_steps(clean_steps: &CleanSteps, build: &mut Build) -> usize {
    let mut discarded = 0;
    let mut queue: std::collections::VecDeque<usize> = build.ready_steps.drain(..).collect();
    let mut still_ready = Vec::new();

    while let Some(index) = queue.pop_front() {
        if !clean_steps[index].is_clean() {
            still_ready.push(index);
            continue;
        }
        discarded += 1;
        let dependents = build.step_nodes[index].dependents.clone();
        for dependent in dependents {
            let node = &mut build.step_nodes[dependent];
            node.dependencies -= 1;
            if node.dependencies == 0 && node.should_build {
                queue.push_back(dependent);
            }
        }
    }

    build.ready_steps = still_ready;
    discarded
}

/// Have the recorded outputs of `step_hash` drifted from the file system?
///
/// Inputs are ignored. A missing entry counts as changed. Used for restat
/// pruning: a restat step whose outputs are byte-identical to its previous
/// run lets its dependents be re-evaluated instead of rerun.
pub fn outputs_were_changed(
    fs: &impl FileSystem,
    paths: &Paths,
    invocations: &Invocations,
    step_hash: Hash,
) -> Result<bool> {
    let Some(entry) = invocations.entries.get(&step_hash) else {
        return Ok(true);
    };
    for &(id, fingerprint) in &entry.output_files {
        if !fingerprint_matches(fs, &paths.resolve(id), &fingerprint)?.clean {
            return Ok(true);
        }
    }
    Ok(false)
}
