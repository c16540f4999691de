//! Shared core types: sides, file records, index entries, diff statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::paths::RelPath;

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// One of the two storage roots the engine coordinates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Lake,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Local, Side::Lake];

    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Lake,
            Side::Lake => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Lake => "lake",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Side::Local),
            "lake" => Ok(Side::Lake),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// File records and index entries
// ---------------------------------------------------------------------------

/// A regular file discovered by the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub relpath: RelPath,
    pub size: u64,
    /// Modification time, millisecond-precision UTC.
    pub mtime_ms: i64,
}

/// One live file on a side. The `hash` field is filled in lazily from the
/// hash cache or by completed hash work.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub relpath: RelPath,
    pub size: u64,
    pub mtime_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl IndexEntry {
    pub fn from_record(rec: FileRecord, hash: Option<String>) -> Self {
        Self { relpath: rec.relpath, size: rec.size, mtime_ms: rec.mtime_ms, hash }
    }
}

/// Aggregate per-side numbers for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SideStats {
    pub file_count: usize,
    pub total_bytes: u64,
}

// ---------------------------------------------------------------------------
// Diff model
// ---------------------------------------------------------------------------

/// Classification of a relpath joined across both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    OnlyLocal,
    OnlyLake,
    Same,
    ProbableSame,
    Conflict,
}

/// The per-relpath join of the two side indexes.
#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub relpath: RelPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lake_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lake_hash: Option<String>,
    pub status: DiffStatus,
}

// ---------------------------------------------------------------------------
// Cooperative cancellation
// ---------------------------------------------------------------------------

/// Shared flag observed by chunked I/O loops between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    system_time_ms(SystemTime::now())
}

/// Convert a `SystemTime` to epoch milliseconds (negative before the epoch).
pub fn system_time_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Convert epoch milliseconds back to a `SystemTime`.
pub fn ms_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

/// Millisecond mtime of a live file's metadata.
pub fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified().map(system_time_ms).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_str() {
        for side in Side::ALL {
            assert_eq!(side.as_str().parse::<Side>().unwrap(), side);
        }
        assert!("ssd".parse::<Side>().is_err());
    }

    #[test]
    fn system_time_ms_round_trips() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_123_456);
        assert_eq!(system_time_ms(t), 1_700_000_123_456);
        assert_eq!(ms_to_system_time(1_700_000_123_456), t);
    }

    #[test]
    fn cancel_token_is_sticky() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
