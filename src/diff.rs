//! Diff engine: joins the two side indexes by relpath and classifies each
//! entry.
//!
//! Classification rules, in order: present on one side only; both hashes
//! known and equal (`same`) or unequal (`conflict`); sizes unequal
//! (`conflict`); otherwise `probable_same`. Only `probable_same` may be
//! upgraded by later hashing; `conflict` is terminal until a side changes
//! on disk.

use crate::index::Snapshot;
use crate::types::{DiffEntry, DiffStatus, IndexEntry};

/// Classify one relpath given its presence on each side.
pub fn classify(local: Option<&IndexEntry>, lake: Option<&IndexEntry>) -> DiffStatus {
    match (local, lake) {
        (Some(_), None) => DiffStatus::OnlyLocal,
        (None, Some(_)) => DiffStatus::OnlyLake,
        (None, None) => unreachable!("classify called with neither side present"),
        (Some(l), Some(k)) => match (&l.hash, &k.hash) {
            (Some(lh), Some(kh)) if lh == kh => DiffStatus::Same,
            (Some(_), Some(_)) => DiffStatus::Conflict,
            _ if l.size != k.size => DiffStatus::Conflict,
            _ => DiffStatus::ProbableSame,
        },
    }
}

/// Join two snapshots into the full diff, ordered by relpath.
pub fn diff_snapshots(local: &Snapshot, lake: &Snapshot) -> Vec<DiffEntry> {
    let mut out = Vec::with_capacity(local.len().max(lake.len()));
    let mut l_iter = local.iter().peekable();
    let mut k_iter = lake.iter().peekable();

    loop {
        let (l_entry, k_entry) = match (l_iter.peek(), k_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => (l_iter.next(), None),
            (None, Some(_)) => (None, k_iter.next()),
            (Some((lp, _)), Some((kp, _))) => match lp.cmp(kp) {
                std::cmp::Ordering::Less => (l_iter.next(), None),
                std::cmp::Ordering::Greater => (None, k_iter.next()),
                std::cmp::Ordering::Equal => (l_iter.next(), k_iter.next()),
            },
        };
        let local_e = l_entry.map(|(_, e)| e);
        let lake_e = k_entry.map(|(_, e)| e);
        let relpath = local_e.or(lake_e).expect("at least one side present").relpath.clone();
        out.push(DiffEntry {
            relpath,
            local_size: local_e.map(|e| e.size),
            local_hash: local_e.and_then(|e| e.hash.clone()),
            lake_size: lake_e.map(|e| e.size),
            lake_hash: lake_e.and_then(|e| e.hash.clone()),
            status: classify(local_e, lake_e),
        });
    }
    out
}
