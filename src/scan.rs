//! Scanner: walks a side's root and produces the file records that become
//! that side's index snapshot.
//!
//! Regular files only; symlinks are not followed; hidden entries at the
//! root (the source-URL sidecar, app droppings) and `.part` staging files
//! are excluded. A failed stat on an individual entry is logged and
//! skipped; a root that cannot be opened fails the whole scan.

use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::HashCache;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::paths::{to_relpath, RelPath};
use crate::types::{mtime_ms, FileRecord, IndexEntry, Side};

/// Extension of copy staging files; never indexed.
pub const PART_SUFFIX: &str = ".part";

/// How many records between `scan_progress` events.
const PROGRESS_EVERY: usize = 500;

/// Walk `root` and build the side's new index map. Hashes are carried over
/// from the cache wherever the stored `(size, mtime)` still matches.
pub fn scan_side(
    root: &Path,
    side: Side,
    cache: &HashCache,
    bus: &EventBus,
) -> Result<BTreeMap<RelPath, IndexEntry>> {
    // A root we cannot open is fatal to the scan.
    fs::read_dir(root).map_err(|e| Error::from_io(e, "open scan root"))?;

    let records = collect_records(root);

    // One bulk cache read instead of a query per file.
    let cached: BTreeMap<RelPath, (u64, i64, String)> = cache
        .entries_for_side(side)?
        .into_iter()
        .map(|e| (e.relpath.clone(), (e.size, e.mtime_ms, e.hash)))
        .collect();

    let mut map = BTreeMap::new();
    for (i, rec) in records.into_iter().enumerate() {
        let hash = cached
            .get(&rec.relpath)
            .filter(|(size, mtime, _)| *size == rec.size && *mtime == rec.mtime_ms)
            .map(|(_, _, h)| h.clone());
        map.insert(rec.relpath.clone(), IndexEntry::from_record(rec, hash));
        if (i + 1) % PROGRESS_EVERY == 0 {
            bus.publish(Event::ScanProgress { side, files_seen: i + 1 });
        }
    }
    bus.publish(Event::ScanProgress { side, files_seen: map.len() });
    Ok(map)
}

/// Parallel walk yielding `{relpath, size, mtime}` per regular file, sorted
/// by relpath.
fn collect_records(root: &Path) -> Vec<FileRecord> {
    let raw: Mutex<Vec<(PathBuf, RelPath)>> = Mutex::new(Vec::new());

    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .filter_entry(|entry| {
            // Hidden entries directly under the root are not library content.
            if entry.depth() == 1 {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') {
                        return false;
                    }
                }
            }
            true
        })
        .build_parallel()
        .run(|| {
            Box::new(|entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable entry");
                        return ignore::WalkState::Continue;
                    }
                };
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    return ignore::WalkState::Continue;
                }
                let abs = entry.path().to_path_buf();
                if abs.to_string_lossy().ends_with(PART_SUFFIX) {
                    return ignore::WalkState::Continue;
                }
                let Ok(relpath) = to_relpath(root, &abs) else {
                    return ignore::WalkState::Continue;
                };
                raw.lock().unwrap().push((abs, relpath));
                ignore::WalkState::Continue
            })
        });

    let mut records: Vec<FileRecord> = raw
        .into_inner()
        .unwrap()
        .into_par_iter()
        .filter_map(|(abs, relpath)| match fs::metadata(&abs) {
            Ok(meta) => Some(FileRecord { relpath, size: meta.len(), mtime_ms: mtime_ms(&meta) }),
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "Failed to stat, skipping");
                None
            }
        })
        .collect();

    records.sort_by(|a, b| a.relpath.cmp(&b.relpath));
    records
}

/// Remove stray `.part` staging files left behind by a crash. Called at
/// startup before the executor claims any task.
pub fn sweep_part_files(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .build()
        .flatten()
    {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        if entry.path().to_string_lossy().ends_with(PART_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "Removed stray part file");
                    removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove part file"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn scan_indexes_regular_files_sorted() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "checkpoints/b.safetensors", b"bbbb");
        write_file(dir.path(), "checkpoints/a.safetensors", b"aa");
        write_file(dir.path(), "loras/x.pt", b"x");

        let cache = HashCache::open_in_memory().unwrap();
        let bus = EventBus::new();
        let map = scan_side(dir.path(), Side::Local, &cache, &bus).unwrap();

        let paths: Vec<&str> = map.keys().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["checkpoints/a.safetensors", "checkpoints/b.safetensors", "loras/x.pt"]);
        assert_eq!(map[&RelPath::new("checkpoints/a.safetensors").unwrap()].size, 2);
    }

    #[test]
    fn scan_skips_root_dotfiles_and_part_files() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), ".model_sources.json", b"{}");
        write_file(dir.path(), "sub/.hidden", b"h");
        write_file(dir.path(), "sub/copy.bin.part", b"partial");
        write_file(dir.path(), "sub/real.bin", b"data");

        let cache = HashCache::open_in_memory().unwrap();
        let bus = EventBus::new();
        let map = scan_side(dir.path(), Side::Lake, &cache, &bus).unwrap();

        let paths: Vec<&str> = map.keys().map(|p| p.as_str()).collect();
        // Only root-level dot entries are excluded; nested ones are content.
        assert_eq!(paths, vec!["sub/.hidden", "sub/real.bin"]);
    }

    #[test]
    fn scan_carries_fresh_cache_hashes_only() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "m.bin", b"0123456789");

        let cache = HashCache::open_in_memory().unwrap();
        let bus = EventBus::new();
        let rp = RelPath::new("m.bin").unwrap();
        let meta = fs::metadata(dir.path().join("m.bin")).unwrap();

        // Fresh row: carried over.
        cache.put(Side::Local, &rp, meta.len(), mtime_ms(&meta), "livehash").unwrap();
        let map = scan_side(dir.path(), Side::Local, &cache, &bus).unwrap();
        assert_eq!(map[&rp].hash.as_deref(), Some("livehash"));

        // Stale row (size mismatch): ignored.
        cache.put(Side::Local, &rp, meta.len() + 1, mtime_ms(&meta), "stale").unwrap();
        let map = scan_side(dir.path(), Side::Local, &cache, &bus).unwrap();
        assert_eq!(map[&rp].hash, None);
    }

    #[test]
    fn scan_fails_on_missing_root() {
        let cache = HashCache::open_in_memory().unwrap();
        let bus = EventBus::new();
        assert!(scan_side(Path::new("/definitely/not/here"), Side::Local, &cache, &bus).is_err());
    }

    #[test]
    fn sweep_removes_only_part_files() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a/big.safetensors.part", b"half");
        write_file(dir.path(), "a/big.safetensors", b"whole");

        assert_eq!(sweep_part_files(dir.path()), 1);
        assert!(!dir.path().join("a/big.safetensors.part").exists());
        assert!(dir.path().join("a/big.safetensors").exists());
    }
}
