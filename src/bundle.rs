//! Bundles: named ordered sets of relpaths, stored independently of the
//! indexes as JSON files under the app data dir. External provisioning
//! flows reference them by name.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::paths::RelPath;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub relpath: RelPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub entries: Vec<BundleEntry>,
}

pub struct BundleStore {
    dir: PathBuf,
    // Serializes whole-file rewrites.
    write_lock: Mutex<()>,
}

/// Bundle names become file names; keep them to one safe segment.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > 128
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || name.starts_with('.')
    {
        return Err(Error::Invalid(format!("invalid bundle name: {name:?}")));
    }
    Ok(())
}

impl BundleStore {
    pub fn open(app_data_dir: &Path) -> Result<Self> {
        let dir = app_data_dir.join("bundles");
        fs::create_dir_all(&dir).map_err(|e| Error::from_io(e, "create bundles dir"))?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::from_io(e, "read bundles dir"))? {
            let entry = entry.map_err(|e| Error::from_io(e, "read bundles dir"))?;
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Result<Option<Bundle>> {
        validate_name(name)?;
        match fs::read(self.path_for(name)) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from_io(e, "read bundle")),
            Ok(bytes) => {
                let bundle = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Invalid(format!("unreadable bundle {name}: {e}")))?;
                Ok(Some(bundle))
            }
        }
    }

    /// Create or replace a bundle atomically.
    pub fn put(&self, bundle: &Bundle) -> Result<()> {
        validate_name(&bundle.name)?;
        let _guard = self.write_lock.lock().unwrap();
        let path = self.path_for(&bundle.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(bundle)
            .map_err(|e| Error::Invalid(format!("bundle serialization: {e}")))?;
        let mut f = fs::File::create(&tmp).map_err(|e| Error::from_io(e, "write bundle"))?;
        f.write_all(&json).map_err(|e| Error::from_io(e, "write bundle"))?;
        f.sync_all().map_err(|e| Error::from_io(e, "sync bundle"))?;
        fs::rename(&tmp, &path).map_err(|e| Error::from_io(e, "rename bundle"))?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let _guard = self.write_lock.lock().unwrap();
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from_io(e, "delete bundle")),
        }
    }
}
