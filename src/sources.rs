//! Source-URL sidecar: `hash → download URL`, stored on the Lake root.
//!
//! The sidecar lives at `<lake_root>/.model_sources.json` so every
//! installation pointed at the same Lake shares it. Reads tolerate an
//! absent file; writes go through a temp file and an atomic rename. Keys
//! are content hashes, with `relpath:<relpath>` as the fallback for files
//! that have not been hashed yet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::paths::RelPath;
use crate::types::now_ms;

pub const SIDECAR_NAME: &str = ".model_sources.json";

/// A public download URL associated with a file's hash (or relpath).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUrl {
    pub key: String,
    pub url: String,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_hint: Option<String>,
}

/// On-disk document shape.
#[derive(Default, Serialize, Deserialize)]
struct Sidecar {
    sources: BTreeMap<String, SourceUrl>,
}

pub struct SourceStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, SourceUrl>>,
}

/// Sidecar key for a file that has no hash yet.
pub fn relpath_key(relpath: &RelPath) -> String {
    format!("relpath:{relpath}")
}

impl SourceStore {
    /// Open the sidecar under `lake_root`. A missing or unparsable file
    /// starts the store empty; a corrupt sidecar is logged, not fatal.
    pub fn open(lake_root: &Path) -> Self {
        let path = lake_root.join(SIDECAR_NAME);
        let sources = match fs::read(&path) {
            Err(_) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
                Ok(doc) => doc.sources,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable source sidecar, starting empty");
                    BTreeMap::new()
                }
            },
        };
        Self { path, inner: Mutex::new(sources) }
    }

    pub fn list(&self) -> Vec<SourceUrl> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<SourceUrl> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn put(
        &self,
        key: &str,
        url: &str,
        notes: Option<String>,
        filename_hint: Option<String>,
    ) -> Result<SourceUrl> {
        if url.is_empty() {
            return Err(Error::Invalid("url must not be empty".into()));
        }
        let entry = SourceUrl {
            key: key.to_string(),
            url: url.to_string(),
            added_at: now_ms(),
            notes,
            filename_hint,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key.to_string(), entry.clone());
        self.persist(&inner)?;
        Ok(entry)
    }

    /// Delete a key; absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.remove(key).is_some();
        if removed {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    /// Move a `relpath:` entry onto its hash key once the hash is known.
    pub fn promote_to_hash(&self, relpath: &RelPath, hash: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut entry) = inner.remove(&relpath_key(relpath)) else {
            return Ok(false);
        };
        entry.key = hash.to_string();
        inner.insert(hash.to_string(), entry);
        self.persist(&inner)?;
        Ok(true)
    }

    /// Rewrite the sidecar atomically: temp file in the same directory,
    /// fsync, rename over the old document.
    fn persist(&self, sources: &BTreeMap<String, SourceUrl>) -> Result<()> {
        let doc = Sidecar { sources: sources.clone() };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::Invalid(format!("sidecar serialization: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).map_err(|e| Error::from_io(e, "sidecar write"))?;
        f.write_all(&json).map_err(|e| Error::from_io(e, "sidecar write"))?;
        f.sync_all().map_err(|e| Error::from_io(e, "sidecar sync"))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::from_io(e, "sidecar rename"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_sidecar_reads_empty() {
        let dir = tempdir().unwrap();
        let store = SourceStore::open(dir.path());
        assert!(store.list().is_empty());
    }

    #[test]
    fn put_persists_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let store = SourceStore::open(dir.path());
        store.put("abc123", "https://example.com/model.safetensors", None, None).unwrap();

        let reopened = SourceStore::open(dir.path());
        let entry = reopened.get("abc123").unwrap();
        assert_eq!(entry.url, "https://example.com/model.safetensors");
        // No temp file left behind.
        assert!(!dir.path().join(".model_sources.json.tmp").exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SourceStore::open(dir.path());
        store.put("k", "https://x", None, None).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn promote_moves_relpath_entry_onto_hash() {
        let dir = tempdir().unwrap();
        let store = SourceStore::open(dir.path());
        let rp = RelPath::new("loras/style.safetensors").unwrap();
        store.put(&relpath_key(&rp), "https://x/y", None, None).unwrap();

        assert!(store.promote_to_hash(&rp, "deadbeef").unwrap());
        assert!(store.get(&relpath_key(&rp)).is_none());
        assert_eq!(store.get("deadbeef").unwrap().url, "https://x/y");
        // Nothing to promote the second time.
        assert!(!store.promote_to_hash(&rp, "deadbeef").unwrap());
    }

    #[test]
    fn corrupt_sidecar_starts_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SIDECAR_NAME), b"{not json").unwrap();
        let store = SourceStore::open(dir.path());
        assert!(store.list().is_empty());
    }
}
