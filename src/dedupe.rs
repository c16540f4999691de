//! Duplicate-group scanner and executor.
//!
//! A scan walks one side's index, hashes candidates (through the cache and
//! the hash pool), groups by full digest, and persists groups of two or
//! more under a fresh scan id. Executing a selection enqueues ordinary
//! delete tasks for every non-kept member; dedupe deletes bypass the
//! sync-delete policy by contract. Groups whose files changed since the
//! scan are skipped and reported, never deleted.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::paths::{join, RelPath};
use crate::queue::TaskPayload;
use crate::types::{mtime_ms, now_ms, CancelToken, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeMode {
    /// Pre-group by `(size, mtime)` and hash only plausible duplicates.
    Fast,
    /// Hash every candidate.
    Full,
}

impl DedupeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupeMode::Fast => "fast",
            DedupeMode::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateFile {
    pub relpath: RelPath,
    pub size: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub hash: String,
    pub side: Side,
    pub files: Vec<DuplicateFile>,
}

/// Persisted scan header.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRow {
    pub id: String,
    pub side: Side,
    pub mode: String,
    pub min_size_bytes: u64,
    pub created_at: i64,
    pub status: String,
    pub group_count: usize,
    pub total_bytes_redundant: u64,
}

/// Completion payload for a `dedupe_scan` task.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub duplicate_groups: usize,
    pub total_bytes_redundant: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Selection {
    pub group_id: i64,
    pub keep_relpath: RelPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedGroup {
    pub group_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    /// Files enqueued for deletion.
    pub deleted: usize,
    pub freed_bytes: u64,
    pub skipped: Vec<SkippedGroup>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct DedupeStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scans (
    id                    TEXT PRIMARY KEY,
    side                  TEXT NOT NULL,
    mode                  TEXT NOT NULL,
    min_size_bytes        INTEGER NOT NULL,
    created_at            INTEGER NOT NULL,
    status                TEXT NOT NULL,
    group_count           INTEGER NOT NULL DEFAULT 0,
    total_bytes_redundant INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS scan_groups (
    scan_id  TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    hash     TEXT NOT NULL,
    side     TEXT NOT NULL,
    files    TEXT NOT NULL,
    PRIMARY KEY (scan_id, group_id)
);";

impl DedupeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert_scan(&self, row: &ScanRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scans (id, side, mode, min_size_bytes, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.side.as_str(),
                row.mode,
                row.min_size_bytes as i64,
                row.created_at,
                row.status
            ],
        )?;
        Ok(())
    }

    fn finish_scan(
        &self,
        scan_id: &str,
        status: &str,
        group_count: usize,
        total_bytes_redundant: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scans SET status = ?2, group_count = ?3, total_bytes_redundant = ?4
             WHERE id = ?1",
            params![scan_id, status, group_count as i64, total_bytes_redundant as i64],
        )?;
        Ok(())
    }

    fn insert_group(&self, scan_id: &str, group: &DuplicateGroup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_groups (scan_id, group_id, hash, side, files)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scan_id,
                group.id,
                group.hash,
                group.side.as_str(),
                serde_json::to_string(&group.files).unwrap_or_default()
            ],
        )?;
        Ok(())
    }

    fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanRow> {
        let side: String = row.get(1)?;
        Ok(ScanRow {
            id: row.get(0)?,
            side: side.parse().unwrap_or(Side::Local),
            mode: row.get(2)?,
            min_size_bytes: row.get::<_, i64>(3)? as u64,
            created_at: row.get(4)?,
            status: row.get(5)?,
            group_count: row.get::<_, i64>(6)? as usize,
            total_bytes_redundant: row.get::<_, i64>(7)? as u64,
        })
    }

    /// Recent scan headers, newest first.
    pub fn list_scans(&self, limit: usize) -> Result<Vec<ScanRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, side, mode, min_size_bytes, created_at, status, group_count,
                    total_bytes_redundant
             FROM scans ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_from_sql)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn latest_scan(&self) -> Result<Option<ScanRow>> {
        Ok(self.list_scans(1)?.into_iter().next())
    }

    pub fn get_scan(&self, scan_id: &str) -> Result<Option<ScanRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, side, mode, min_size_bytes, created_at, status, group_count,
                        total_bytes_redundant
                 FROM scans WHERE id = ?1",
                params![scan_id],
                Self::row_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_scan(&self, scan_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM scan_groups WHERE scan_id = ?1", params![scan_id])?;
        let n = conn.execute("DELETE FROM scans WHERE id = ?1", params![scan_id])?;
        Ok(n > 0)
    }

    pub fn groups(&self, scan_id: &str) -> Result<Vec<DuplicateGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT group_id, hash, side, files FROM scan_groups
             WHERE scan_id = ?1 ORDER BY group_id",
        )?;
        let rows = stmt.query_map(params![scan_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, hash, side, files) = row?;
            out.push(DuplicateGroup {
                id,
                hash,
                side: side.parse().unwrap_or(Side::Local),
                files: serde_json::from_str(&files).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    pub fn group(&self, scan_id: &str, group_id: i64) -> Result<Option<DuplicateGroup>> {
        Ok(self.groups(scan_id)?.into_iter().find(|g| g.id == group_id))
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Run a duplicate scan as the body of a `dedupe_scan` task.
pub fn run_scan(
    engine: &Engine,
    side: Side,
    mode: DedupeMode,
    min_size_bytes: u64,
    cancel: &CancelToken,
) -> Result<ScanSummary> {
    let scan_id = Uuid::new_v4().to_string();
    engine.dedupe.insert_scan(&ScanRow {
        id: scan_id.clone(),
        side,
        mode: mode.as_str().to_string(),
        min_size_bytes,
        created_at: now_ms(),
        status: "running".to_string(),
        group_count: 0,
        total_bytes_redundant: 0,
    })?;

    match scan_groups(engine, side, mode, min_size_bytes, cancel) {
        Ok(groups) => {
            let count = groups.len();
            let mut total_redundant = 0u64;
            for (i, (hash, files)) in groups.into_iter().enumerate() {
                let redundant: u64 = files.iter().skip(1).map(|f| f.size).sum();
                total_redundant += redundant;
                engine.dedupe.insert_group(
                    &scan_id,
                    &DuplicateGroup { id: i as i64 + 1, hash, side, files },
                )?;
            }
            engine.dedupe.finish_scan(&scan_id, "completed", count, total_redundant)?;
            Ok(ScanSummary {
                scan_id,
                duplicate_groups: count,
                total_bytes_redundant: total_redundant,
            })
        }
        Err(e) => {
            let status = if cancel.is_cancelled() { "cancelled" } else { "failed" };
            let _ = engine.dedupe.finish_scan(&scan_id, status, 0, 0);
            Err(e)
        }
    }
}

/// Hash candidates and bucket them by digest. Returns only buckets with two
/// or more members, ordered by first relpath.
fn scan_groups(
    engine: &Engine,
    side: Side,
    mode: DedupeMode,
    min_size_bytes: u64,
    cancel: &CancelToken,
) -> Result<Vec<(String, Vec<DuplicateFile>)>> {
    let snap = engine.index.snapshot(side);
    let candidates: Vec<_> =
        snap.values().filter(|e| e.size >= min_size_bytes).collect();

    let chosen: Vec<_> = match mode {
        DedupeMode::Full => candidates,
        DedupeMode::Fast => {
            // Only files sharing (size, mtime) with another file can be
            // duplicates worth hashing in fast mode.
            let mut by_stat: BTreeMap<(u64, i64), usize> = BTreeMap::new();
            for e in &candidates {
                *by_stat.entry((e.size, e.mtime_ms)).or_default() += 1;
            }
            candidates
                .into_iter()
                .filter(|e| by_stat[&(e.size, e.mtime_ms)] >= 2)
                .collect()
        }
    };

    // Feed the pool first, then collect; workers stream while we submit.
    let mut pending = Vec::with_capacity(chosen.len());
    for entry in chosen {
        if cancel.is_cancelled() {
            return Err(Error::TransientIo("dedupe scan cancelled".into()));
        }
        let rx =
            engine.hasher.submit(side, entry.relpath.clone(), false, cancel.clone());
        pending.push((entry.relpath.clone(), rx));
    }

    let mut buckets: BTreeMap<String, Vec<DuplicateFile>> = BTreeMap::new();
    for (relpath, rx) in pending {
        if cancel.is_cancelled() {
            return Err(Error::TransientIo("dedupe scan cancelled".into()));
        }
        match rx.recv().map_err(|_| Error::Invalid("hash pool stopped".into()))? {
            Ok(outcome) => {
                buckets.entry(outcome.hash).or_default().push(DuplicateFile {
                    relpath,
                    size: outcome.size,
                    mtime_ms: outcome.mtime_ms,
                });
            }
            // A file that vanished or raced mid-scan simply drops out.
            Err(Error::NotFound { .. }) | Err(Error::HashRaced(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(buckets.into_iter().filter(|(_, files)| files.len() >= 2).collect())
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

/// Enqueue deletions for every non-kept member of the selected groups.
/// Best-effort: a group whose files changed since the scan is skipped and
/// reported.
pub fn execute(engine: &Engine, scan_id: &str, selections: &[Selection]) -> Result<ExecuteReport> {
    if engine.dedupe.get_scan(scan_id)?.is_none() {
        return Err(Error::Invalid(format!("unknown scan: {scan_id}")));
    }

    let mut report = ExecuteReport { deleted: 0, freed_bytes: 0, skipped: Vec::new() };

    for sel in selections {
        let Some(group) = engine.dedupe.group(scan_id, sel.group_id)? else {
            report.skipped.push(SkippedGroup {
                group_id: sel.group_id,
                error: format!("no group {} in scan", sel.group_id),
            });
            continue;
        };
        if !group.files.iter().any(|f| f.relpath == sel.keep_relpath) {
            report.skipped.push(SkippedGroup {
                group_id: sel.group_id,
                error: format!("{} is not a member of the group", sel.keep_relpath),
            });
            continue;
        }

        if let Err(e) = check_group_fresh(engine, &group) {
            report.skipped.push(SkippedGroup { group_id: sel.group_id, error: e.to_string() });
            continue;
        }

        for file in group.files.iter().filter(|f| f.relpath != sel.keep_relpath) {
            engine.queue.enqueue(TaskPayload::Delete {
                side: group.side,
                relpath: file.relpath.clone(),
                from_dedupe: true,
            })?;
            report.deleted += 1;
            report.freed_bytes += file.size;
        }
    }
    Ok(report)
}

/// Every member must still match its recorded stat, or the whole group is
/// stale.
fn check_group_fresh(engine: &Engine, group: &DuplicateGroup) -> Result<()> {
    for file in &group.files {
        let abs = join(engine.config.root(group.side), &file.relpath)?;
        let fresh = std::fs::metadata(&abs)
            .map_err(|_| Error::DedupeStaleGroup(file.relpath.to_string()))?;
        if fresh.len() != file.size || mtime_ms(&fresh) != file.mtime_ms {
            return Err(Error::DedupeStaleGroup(file.relpath.to_string()));
        }
    }
    Ok(())
}
