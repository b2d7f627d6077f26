//! Removing outputs the build no longer stands behind.

use std::collections::HashSet;

use tracing::debug;

use shk_fs::{FileSystem, Hash, PathId, Paths};
use shk_log::{InvocationLog, Invocations};

use crate::error::Result;

/// Delete the declared outputs of files we are about to regenerate, and
/// prune any directories this build system created that are left empty.
///
/// No-op for steps with no recorded invocation. Inputs are never touched.
pub fn delete_old_outputs(
    fs: &impl FileSystem,
    invocations: &mut Invocations,
    log: &mut dyn InvocationLog,
    paths: &Paths,
    step_hash: Hash,
) -> Result<()> {
    let Some(entry) = invocations.entries.get(&step_hash) else {
        return Ok(());
    };
    let outputs: Vec<PathId> = entry.output_files.iter().map(|&(id, _)| id).collect();
    delete_files_and_prune_dirs(fs, invocations, log, paths, &outputs)
}

/// Remove entries (and their outputs) for steps that no longer exist in
/// the manifest. Called once at the start of a build, before scheduling.
pub fn delete_stale_outputs(
    fs: &impl FileSystem,
    invocations: &mut Invocations,
    log: &mut dyn InvocationLog,
    paths: &Paths,
    step_hashes: &[Hash],
) -> Result<()> {
    let live: HashSet<Hash> = step_hashes.iter().copied().collect();
    let stale: Vec<Hash> = invocations
        .entries
        .keys()
        .filter(|hash| !live.contains(hash))
        .copied()
        .collect();

    for hash in stale {
        debug!(hash = %hash.short_hex(), "removing outputs of stale build step");
        delete_old_outputs(fs, invocations, log, paths, hash)?;
        log.cleaned_command(hash)?;
        invocations.entries.remove(&hash);
    }
    Ok(())
}

fn delete_files_and_prune_dirs(
    fs: &impl FileSystem,
    invocations: &mut Invocations,
    log: &mut dyn InvocationLog,
    paths: &Paths,
    outputs: &[PathId],
) -> Result<()> {
    for &id in outputs {
        let path = paths.resolve(id);
        let stat = fs.stat(&path)?;
        if !stat.could_access || stat.is_dir() {
            continue;
        }
        match fs.unlink(&path) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    // Directories this build created that may now be empty: walk each
    // output's ancestors, deepest first, and remove while they stay empty.
    let mut candidates: Vec<PathId> = Vec::new();
    let mut seen = HashSet::new();
    for &id in outputs {
        let mut ancestor = paths.resolve(id);
        while let Some(parent) = ancestor.parent().map(|p| p.to_owned()) {
            if parent.as_str().is_empty() {
                break;
            }
            let parent_id = paths.get(&parent);
            if invocations.created_directories.contains(&parent_id) && seen.insert(parent_id) {
                candidates.push(parent_id);
            }
            ancestor = parent;
        }
    }
    candidates.sort_by_key(|&id| std::cmp::Reverse(paths.resolve(id).components().count()));

    for id in candidates {
        let path = paths.resolve(id);
        let Ok(entries) = fs.read_dir(&path) else {
            continue;
        };
        if !entries.is_empty() {
            continue;
        }
        if fs.rmdir(&path).is_ok() {
            log.removed_directory(id)?;
            invocations.created_directories.remove(&id);
        }
    }
    Ok(())
}
