//! The immutable build graph handed over by the manifest parser.
//!
//! Files and steps cross-reference each other, which in an ownership
//! language invites a cycle of pointers. Instead, steps live in one vector
//! indexed by [`StepIndex`], files are interned [`PathId`]s, and the
//! derived tables below map between them.

use std::collections::HashMap;

use shk_fs::{Hash, PathId, Paths};

use crate::error::{BuildError, Result};

/// Index of a step in [`BuildGraph::steps`].
pub type StepIndex = usize;

/// A single build step: one command with its declared files.
#[derive(Debug, Clone, Default)]
pub struct Step {
    /// Rule name, part of the step's identity.
    pub rule: String,
    /// The shell command. Empty for phony steps, which propagate
    /// dependencies without running anything.
    pub command: String,
    /// Human-readable progress line; falls back to the command.
    pub description: Option<String>,
    /// Pool name; `""` means the unlimited default pool.
    pub pool: String,
    /// Explicit inputs.
    pub inputs: Vec<PathId>,
    /// Implicit inputs: dependency edges without command-line presence.
    pub implicit_inputs: Vec<PathId>,
    /// Order-only inputs: scheduling edges that do not dirty the step.
    pub order_only_inputs: Vec<PathId>,
    pub outputs: Vec<PathId>,
    /// Restat steps may legitimately rewrite outputs with identical
    /// contents; unchanged outputs prune dependent rebuilds.
    pub restat: bool,
}

impl Step {
    pub fn is_phony(&self) -> bool {
        self.command.is_empty()
    }

    /// Every declared input, in declaration order.
    pub fn all_inputs(&self) -> impl Iterator<Item = PathId> + '_ {
        self.inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .chain(self.order_only_inputs.iter())
            .copied()
    }

    pub fn display_name(&self, paths: &Paths) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        if !self.command.is_empty() {
            return self.command.clone();
        }
        match self.outputs.first() {
            Some(&output) => format!("phony {}", paths.resolve(output)),
            None => "phony".to_string(),
        }
    }

    /// The step's command hash: the digest of everything that makes up its
    /// build identity. Two steps with equal hashes would produce the same
    /// invocation-log entry.
    pub fn step_hash(&self, paths: &Paths) -> Hash {
        let mut hasher = blake3::Hasher::new();

        hasher.update(b"rule:");
        hasher.update(self.rule.as_bytes());
        hasher.update(b"\n");

        hasher.update(b"command:");
        hasher.update(self.command.as_bytes());
        hasher.update(b"\n");

        let mut hash_paths = |label: &[u8], ids: &[PathId]| {
            hasher.update(label);
            for &id in ids {
                hasher.update(paths.resolve(id).as_str().as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(b"\n");
        };
        hash_paths(b"inputs:", &self.inputs);
        hash_paths(b"implicit:", &self.implicit_inputs);
        hash_paths(b"order_only:", &self.order_only_inputs);
        hash_paths(b"outputs:", &self.outputs);

        hasher.finalize().into()
    }
}

/// The parsed manifest, as far as the engine is concerned.
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
    pub steps: Vec<Step>,
    /// Targets built when none are specified; when empty, the roots are
    /// built instead.
    pub defaults: Vec<PathId>,
    /// Named pool capacities.
    pub pools: HashMap<String, usize>,
}

/// Command hash per step, computed once up front.
pub type StepHashes = Vec<Hash>;

pub fn compute_step_hashes(steps: &[Step], paths: &Paths) -> StepHashes {
    steps.iter().map(|step| step.step_hash(paths)).collect()
}

/// Map every declared output file to its producing step. Two steps
/// declaring the same output is a manifest error.
pub fn compute_output_file_map(
    steps: &[Step],
    paths: &Paths,
) -> Result<HashMap<PathId, StepIndex>> {
    let mut map = HashMap::new();
    for (index, step) in steps.iter().enumerate() {
        for &output in &step.outputs {
            if map.insert(output, index).is_some() {
                return Err(BuildError::DuplicateOutput(
                    paths.resolve(output).into_string(),
                ));
            }
        }
    }
    Ok(map)
}

/// Steps whose outputs no other step consumes. These are what gets built
/// when the manifest has no defaults and the user asked for nothing
/// specific.
pub fn root_steps(steps: &[Step], output_file_map: &HashMap<PathId, StepIndex>) -> Vec<StepIndex> {
    let mut consumed = vec![false; steps.len()];
    for step in steps {
        for input in step.all_inputs() {
            if let Some(&producer) = output_file_map.get(&input) {
                consumed[producer] = true;
            }
        }
    }
    consumed
        .iter()
        .enumerate()
        .filter(|&(_, &c)| !c)
        .map(|(index, _)| index)
        .collect()
}

/// Resolve the requested targets to step indices: explicitly specified
/// outputs first, else the manifest defaults, else the roots. Duplicates
/// are preserved; deduplication happens in the traversal.
pub fn steps_to_build(
    graph: &BuildGraph,
    output_file_map: &HashMap<PathId, StepIndex>,
    paths: &Paths,
    specified_outputs: &[PathId],
) -> Result<Vec<StepIndex>> {
    let resolve = |targets: &[PathId]| -> Result<Vec<StepIndex>> {
        targets
            .iter()
            .map(|target| {
                output_file_map.get(target).copied().ok_or_else(|| {
                    BuildError::UnknownTarget(paths.resolve(*target).into_string())
                })
            })
            .collect()
    };

    if !specified_outputs.is_empty() {
        return resolve(specified_outputs);
    }
    if !graph.defaults.is_empty() {
        return resolve(&graph.defaults);
    }
    Ok(root_steps(&graph.steps, output_file_map))
}
