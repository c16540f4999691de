//! Engine error kinds and the transient/fatal classification that drives
//! queue retry.

use thiserror::Error;

use crate::types::Side;

/// Errors surfaced by the storage coordination engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A path input would resolve outside its root.
    #[error("path escapes root: {0}")]
    PathEscape(String),

    /// The relpath is absent on the named side.
    #[error("not found on {side}: {relpath}")]
    NotFound { side: Side, relpath: String },

    /// Copy blocked because the destination diff status is a confirmed conflict.
    #[error("copy refused, destination conflicts: {0}")]
    ConflictRefused(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Timeout, share disconnect, or similar recoverable I/O failure.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The file mutated while it was being hashed.
    #[error("file changed during hashing: {0}")]
    HashRaced(String),

    /// Verify computed a different digest than the cache held.
    #[error("hash mismatch on {side}: {relpath} (cached {cached}, computed {computed})")]
    HashMismatch { side: Side, relpath: String, cached: String, computed: String },

    /// Sync-path delete refused by the side's allow-delete flag.
    #[error("deletes from sync are disabled for {0}")]
    PolicyDenied(Side),

    /// A duplicate group's files changed on disk since the scan.
    #[error("duplicate group changed since scan: {0}")]
    DedupeStaleGroup(String),

    /// Malformed or out-of-contract request input.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the queue should re-enqueue the task instead of failing it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientIo(_) | Error::HashRaced(_) => true,
            Error::Io(e) => is_transient_kind(e.kind()),
            _ => false,
        }
    }

    /// Classify a raw I/O error observed mid-operation, folding recoverable
    /// kinds into [`Error::TransientIo`].
    pub fn from_io(e: std::io::Error, context: &str) -> Error {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::PermissionDenied => Error::PermissionDenied(context.to_string()),
            kind if is_transient_kind(kind) => Error::TransientIo(format!("{context}: {e}")),
            _ => Error::Io(e),
        }
    }
}

fn is_transient_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ResourceBusy
            | ErrorKind::CrossesDevices
    )
}
