//! Persistent hash cache: `(side, relpath, size, mtime) → hash`.
//!
//! Rows are keyed by `(side, relpath)`; a read returns a hash only when the
//! stored size and mtime both match the caller's live stat, so a stale row
//! is indistinguishable from a missing one. Writers are serialized through
//! the connection mutex; a reader sees the old row, the new row, or no row.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::paths::RelPath;
use crate::types::Side;

/// A full cache row, as exported for bulk iteration.
#[derive(Debug, Clone)]
pub struct HashEntry {
    pub relpath: RelPath,
    pub size: u64,
    pub mtime_ms: i64,
    pub hash: String,
}

pub struct HashCache {
    conn: Mutex<Connection>,
}

impl HashCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hash_cache (
                side     TEXT NOT NULL,
                relpath  TEXT NOT NULL,
                size     INTEGER NOT NULL,
                mtime_ms INTEGER NOT NULL,
                hash     TEXT NOT NULL,
                PRIMARY KEY (side, relpath)
            );
            CREATE INDEX IF NOT EXISTS idx_hash_cache_hash ON hash_cache(hash);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory cache for tests and throwaway engines.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hash_cache (
                side     TEXT NOT NULL,
                relpath  TEXT NOT NULL,
                size     INTEGER NOT NULL,
                mtime_ms INTEGER NOT NULL,
                hash     TEXT NOT NULL,
                PRIMARY KEY (side, relpath)
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Look up a hash; returns `Some` only if all four coordinates match.
    pub fn get(
        &self,
        side: Side,
        relpath: &RelPath,
        size: u64,
        mtime_ms: i64,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let hash = conn
            .query_row(
                "SELECT hash FROM hash_cache
                 WHERE side = ?1 AND relpath = ?2 AND size = ?3 AND mtime_ms = ?4",
                params![side.as_str(), relpath.as_str(), size as i64, mtime_ms],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Upsert the row for `(side, relpath)`.
    pub fn put(
        &self,
        side: Side,
        relpath: &RelPath,
        size: u64,
        mtime_ms: i64,
        hash: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO hash_cache (side, relpath, size, mtime_ms, hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(side, relpath) DO UPDATE
             SET size = excluded.size, mtime_ms = excluded.mtime_ms, hash = excluded.hash",
            params![side.as_str(), relpath.as_str(), size as i64, mtime_ms, hash],
        )?;
        Ok(())
    }

    pub fn invalidate(&self, side: Side, relpath: &RelPath) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM hash_cache WHERE side = ?1 AND relpath = ?2",
            params![side.as_str(), relpath.as_str()],
        )?;
        Ok(())
    }

    /// Bulk export of one side's rows, ordered by relpath. Used by dedupe.
    pub fn entries_for_side(&self, side: Side) -> Result<Vec<HashEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT relpath, size, mtime_ms, hash FROM hash_cache
             WHERE side = ?1 ORDER BY relpath",
        )?;
        let rows = stmt.query_map(params![side.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (relpath, size, mtime_ms, hash) = row?;
            // Rows written by this engine always hold valid relpaths.
            if let Ok(relpath) = RelPath::new(&relpath) {
                out.push(HashEntry { relpath, size: size as u64, mtime_ms, hash });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn get_requires_all_four_coordinates() {
        let cache = HashCache::open_in_memory().unwrap();
        let p = rp("checkpoints/a.safetensors");
        cache.put(Side::Local, &p, 1024, 555, "abc123").unwrap();

        assert_eq!(cache.get(Side::Local, &p, 1024, 555).unwrap().as_deref(), Some("abc123"));
        // Any drift makes the row invisible.
        assert_eq!(cache.get(Side::Local, &p, 1025, 555).unwrap(), None);
        assert_eq!(cache.get(Side::Local, &p, 1024, 556).unwrap(), None);
        assert_eq!(cache.get(Side::Lake, &p, 1024, 555).unwrap(), None);
    }

    #[test]
    fn put_is_an_upsert() {
        let cache = HashCache::open_in_memory().unwrap();
        let p = rp("x.bin");
        cache.put(Side::Lake, &p, 10, 1, "old").unwrap();
        cache.put(Side::Lake, &p, 20, 2, "new").unwrap();
        assert_eq!(cache.get(Side::Lake, &p, 10, 1).unwrap(), None);
        assert_eq!(cache.get(Side::Lake, &p, 20, 2).unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn invalidate_removes_the_row() {
        let cache = HashCache::open_in_memory().unwrap();
        let p = rp("x.bin");
        cache.put(Side::Local, &p, 10, 1, "h").unwrap();
        cache.invalidate(Side::Local, &p).unwrap();
        assert_eq!(cache.get(Side::Local, &p, 10, 1).unwrap(), None);
    }

    #[test]
    fn bulk_export_is_per_side_and_ordered() {
        let cache = HashCache::open_in_memory().unwrap();
        cache.put(Side::Local, &rp("b/two"), 2, 2, "h2").unwrap();
        cache.put(Side::Local, &rp("a/one"), 1, 1, "h1").unwrap();
        cache.put(Side::Lake, &rp("c/three"), 3, 3, "h3").unwrap();

        let rows = cache.entries_for_side(Side::Local).unwrap();
        let paths: Vec<&str> = rows.iter().map(|e| e.relpath.as_str()).collect();
        assert_eq!(paths, vec!["a/one", "b/two"]);
    }
}
