//! Per-side file index with copy-on-write snapshots.
//!
//! Each side owns an ordered `relpath → IndexEntry` map. Readers take an
//! `Arc` snapshot and never observe a half-applied mutation; writers clone
//! the map, apply their change, and swap the pointer. The scanner replaces
//! whole snapshots; the executor applies point updates after completed
//! copies, deletes, and hash work.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::paths::RelPath;
use crate::types::{IndexEntry, Side, SideStats};

/// An immutable view of one side's index at a point in time.
pub type Snapshot = Arc<BTreeMap<RelPath, IndexEntry>>;

struct SideIndex {
    current: RwLock<Snapshot>,
}

impl SideIndex {
    fn new() -> Self {
        Self { current: RwLock::new(Arc::new(BTreeMap::new())) }
    }

    fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read().unwrap())
    }

    fn replace(&self, map: BTreeMap<RelPath, IndexEntry>) {
        *self.current.write().unwrap() = Arc::new(map);
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<RelPath, IndexEntry>)) {
        let mut guard = self.current.write().unwrap();
        let mut map = (**guard).clone();
        f(&mut map);
        *guard = Arc::new(map);
    }
}

pub struct IndexStore {
    local: SideIndex,
    lake: SideIndex,
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexStore {
    pub fn new() -> Self {
        Self { local: SideIndex::new(), lake: SideIndex::new() }
    }

    fn side(&self, side: Side) -> &SideIndex {
        match side {
            Side::Local => &self.local,
            Side::Lake => &self.lake,
        }
    }

    pub fn snapshot(&self, side: Side) -> Snapshot {
        self.side(side).snapshot()
    }

    /// Publish a freshly scanned map, replacing the previous snapshot.
    pub fn replace(&self, side: Side, map: BTreeMap<RelPath, IndexEntry>) {
        self.side(side).replace(map);
    }

    pub fn get(&self, side: Side, relpath: &RelPath) -> Option<IndexEntry> {
        self.side(side).snapshot().get(relpath).cloned()
    }

    /// Optimistic point update after a completed copy.
    pub fn upsert(&self, side: Side, entry: IndexEntry) {
        self.side(side).mutate(|map| {
            map.insert(entry.relpath.clone(), entry);
        });
    }

    /// Remove a file that no longer exists on disk.
    pub fn remove(&self, side: Side, relpath: &RelPath) {
        self.side(side).mutate(|map| {
            map.remove(relpath);
        });
    }

    /// Attach a freshly computed hash to a live entry. A stale `(size,
    /// mtime)` means the file changed after hashing; the hash is dropped.
    pub fn set_hash(&self, side: Side, relpath: &RelPath, size: u64, mtime_ms: i64, hash: &str) {
        self.side(side).mutate(|map| {
            if let Some(entry) = map.get_mut(relpath) {
                if entry.size == size && entry.mtime_ms == mtime_ms {
                    entry.hash = Some(hash.to_string());
                }
            }
        });
    }

    pub fn stats(&self, side: Side) -> SideStats {
        let snap = self.snapshot(side);
        SideStats {
            file_count: snap.len(),
            total_bytes: snap.values().map(|e| e.size).sum(),
        }
    }
}
