//! Mirror planner: a pure function over two index snapshots.
//!
//! The plan lists what a one-way folder mirror would copy and delete, plus
//! the conflicts it refuses to touch. Deletes appear only when the
//! destination side allows sync deletes; otherwise the would-be deletions
//! are reported as informational `extras`. Executing a plan enqueues
//! ordinary queue tasks, copies before deletes, conflicts skipped.

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::Result;
use crate::index::Snapshot;
use crate::paths::RelPath;
use crate::queue::TaskPayload;
use crate::types::{IndexEntry, Side};

/// One file in a plan, keyed relative to the mirrored folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub rel: RelPath,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlanTotals {
    pub copy_count: usize,
    pub copy_bytes: u64,
    pub delete_count: usize,
    pub delete_bytes: u64,
    pub extras_count: usize,
    pub conflict_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorPlan {
    pub src_side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_folder: Option<RelPath>,
    pub dst_side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_folder: Option<RelPath>,
    pub copy: Vec<PlanEntry>,
    pub delete: Vec<PlanEntry>,
    /// Files only on the destination, reported when deletes are disallowed.
    pub extras: Vec<PlanEntry>,
    pub conflicts: Vec<PlanEntry>,
    pub totals: PlanTotals,
}

/// Rebase a full relpath to the folder-relative key, or `None` when it is
/// outside the folder.
fn folder_key(relpath: &RelPath, folder: Option<&RelPath>) -> Option<RelPath> {
    match folder {
        None => Some(relpath.clone()),
        Some(f) => relpath.strip_folder(f),
    }
}

fn full_path(folder: Option<&RelPath>, rel: &RelPath) -> RelPath {
    match folder {
        None => rel.clone(),
        Some(f) => f.join(rel),
    }
}

fn is_conflict(a: &IndexEntry, b: &IndexEntry) -> bool {
    match (&a.hash, &b.hash) {
        (Some(x), Some(y)) => x != y,
        _ => a.size != b.size,
    }
}

/// Compute the mirror plan `src_folder@src_side → dst_folder@dst_side`.
#[allow(clippy::too_many_arguments)]
pub fn plan(
    src_snap: &Snapshot,
    dst_snap: &Snapshot,
    src_side: Side,
    src_folder: Option<&RelPath>,
    dst_side: Side,
    dst_folder: Option<&RelPath>,
    allow_delete_dst: bool,
) -> MirrorPlan {
    let src: Vec<(RelPath, &IndexEntry)> = src_snap
        .values()
        .filter_map(|e| folder_key(&e.relpath, src_folder).map(|k| (k, e)))
        .collect();
    let dst: std::collections::BTreeMap<RelPath, &IndexEntry> = dst_snap
        .values()
        .filter_map(|e| folder_key(&e.relpath, dst_folder).map(|k| (k, e)))
        .collect();
    let src_keys: std::collections::BTreeSet<&RelPath> = src.iter().map(|(k, _)| k).collect();

    let mut out = MirrorPlan {
        src_side,
        src_folder: src_folder.cloned(),
        dst_side,
        dst_folder: dst_folder.cloned(),
        copy: Vec::new(),
        delete: Vec::new(),
        extras: Vec::new(),
        conflicts: Vec::new(),
        totals: PlanTotals::default(),
    };

    for (key, src_entry) in &src {
        match dst.get(key) {
            None => out.copy.push(PlanEntry { rel: key.clone(), size: src_entry.size }),
            Some(dst_entry) if is_conflict(src_entry, dst_entry) => {
                out.conflicts.push(PlanEntry { rel: key.clone(), size: src_entry.size });
            }
            Some(_) => {}
        }
    }

    for (key, dst_entry) in &dst {
        if !src_keys.contains(key) {
            let entry = PlanEntry { rel: key.clone(), size: dst_entry.size };
            if allow_delete_dst {
                out.delete.push(entry);
            } else {
                out.extras.push(entry);
            }
        }
    }

    out.totals = PlanTotals {
        copy_count: out.copy.len(),
        copy_bytes: out.copy.iter().map(|e| e.size).sum(),
        delete_count: out.delete.len(),
        delete_bytes: out.delete.iter().map(|e| e.size).sum(),
        extras_count: out.extras.len(),
        conflict_count: out.conflicts.len(),
    };
    out
}

/// Enqueue a previously computed plan: copies first, then deletes.
/// Conflicts are skipped. Returns the created task ids.
pub fn execute(engine: &Engine, plan: &MirrorPlan) -> Result<Vec<String>> {
    let mut task_ids = Vec::with_capacity(plan.copy.len() + plan.delete.len());
    for entry in &plan.copy {
        let task = engine.queue.enqueue(TaskPayload::Copy {
            src_side: plan.src_side,
            src_relpath: full_path(plan.src_folder.as_ref(), &entry.rel),
            dst_side: plan.dst_side,
            dst_relpath: full_path(plan.dst_folder.as_ref(), &entry.rel),
        })?;
        task_ids.push(task.id);
    }
    for entry in &plan.delete {
        let task = engine.queue.enqueue(TaskPayload::Delete {
            side: plan.dst_side,
            relpath: full_path(plan.dst_folder.as_ref(), &entry.rel),
            from_dedupe: false,
        })?;
        task_ids.push(task.id);
    }
    Ok(task_ids)
}
