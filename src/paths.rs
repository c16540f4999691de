//! Canonical relative-path model and the traversal guard.
//!
//! A [`RelPath`] is a normalized, forward-slash-separated path relative to a
//! side's root. It is the cross-side identity of a file: the same relpath on
//! Local and Lake names "the same" file. Every path-bearing API input passes
//! through here before it can touch the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::Error;

/// A normalized root-relative path. Invariants: non-empty, forward slashes,
/// no empty segments, no `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// Validate and normalize a raw path string. Backslashes are accepted and
    /// normalized to forward slashes; a trailing slash is stripped.
    pub fn new(raw: &str) -> Result<Self, Error> {
        let normalized = raw.replace('\\', "/");
        let trimmed = normalized.strip_suffix('/').unwrap_or(&normalized);

        if trimmed.is_empty() {
            return Err(Error::PathEscape(raw.to_string()));
        }
        if trimmed.starts_with('/') {
            return Err(Error::PathEscape(raw.to_string()));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::PathEscape(raw.to_string()));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Everything before the final segment, or `None` at the top level.
    pub fn parent(&self) -> Option<RelPath> {
        self.0.rsplit_once('/').map(|(dir, _)| RelPath(dir.to_string()))
    }

    /// Whether this path sits at or below `folder`.
    pub fn is_under(&self, folder: &RelPath) -> bool {
        self.0 == folder.0
            || (self.0.len() > folder.0.len()
                && self.0.starts_with(&folder.0)
                && self.0.as_bytes()[folder.0.len()] == b'/')
    }

    /// Append further segments, e.g. rebasing a file under a new folder.
    pub fn join(&self, rest: &RelPath) -> RelPath {
        RelPath(format!("{}/{}", self.0, rest.0))
    }

    /// Strip a folder prefix, returning the remainder relative to it.
    pub fn strip_folder(&self, folder: &RelPath) -> Option<RelPath> {
        if self.0 == folder.0 {
            return None;
        }
        self.0
            .strip_prefix(&folder.0)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| RelPath(rest.to_string()))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelPath {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        RelPath::new(&raw)
    }
}

impl From<RelPath> for String {
    fn from(p: RelPath) -> String {
        p.0
    }
}

// ---------------------------------------------------------------------------
// Root joining and the traversal guard
// ---------------------------------------------------------------------------

/// Join `root + relpath` into an absolute path, verifying the result stays
/// lexically inside `root`. All filesystem access in the engine goes through
/// this function.
pub fn join(root: &Path, relpath: &RelPath) -> Result<PathBuf, Error> {
    let joined = root.join(relpath.as_str());
    let mut resolved = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(Error::PathEscape(relpath.to_string()));
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    if !resolved.starts_with(root) || resolved == root {
        return Err(Error::PathEscape(relpath.to_string()));
    }
    Ok(resolved)
}

/// Turn an absolute path back into a relpath under `root`.
pub fn to_relpath(root: &Path, absolute: &Path) -> Result<RelPath, Error> {
    let stripped = absolute
        .strip_prefix(root)
        .map_err(|_| Error::PathEscape(absolute.display().to_string()))?;
    let rel = stripped.to_string_lossy().replace('\\', "/");
    RelPath::new(&rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_paths() {
        let p = RelPath::new("checkpoints/sdxl/base.safetensors").unwrap();
        assert_eq!(p.as_str(), "checkpoints/sdxl/base.safetensors");
        assert_eq!(p.file_name(), "base.safetensors");
        assert_eq!(p.parent().unwrap().as_str(), "checkpoints/sdxl");
    }

    #[test]
    fn normalizes_backslashes_and_trailing_slash() {
        assert_eq!(RelPath::new("a\\b\\c").unwrap().as_str(), "a/b/c");
        assert_eq!(RelPath::new("a/b/").unwrap().as_str(), "a/b");
    }

    #[test]
    fn rejects_traversal_and_absolutes() {
        for bad in ["", "/", "/etc/passwd", "../x", "a/../b", "a//b", "a/./b", ".."] {
            assert!(RelPath::new(bad).is_err(), "expected rejection: {bad:?}");
        }
    }

    #[test]
    fn join_stays_inside_root() {
        let root = Path::new("/data/models");
        let p = RelPath::new("loras/x.safetensors").unwrap();
        assert_eq!(join(root, &p).unwrap(), PathBuf::from("/data/models/loras/x.safetensors"));
    }

    #[test]
    fn to_relpath_inverts_join() {
        let root = Path::new("/data/models");
        let p = RelPath::new("vae/sd.vae.pt").unwrap();
        let abs = join(root, &p).unwrap();
        assert_eq!(to_relpath(root, &abs).unwrap(), p);
        assert!(to_relpath(root, Path::new("/elsewhere/file")).is_err());
    }

    #[test]
    fn is_under_respects_segment_boundaries() {
        let folder = RelPath::new("checkpoints").unwrap();
        assert!(RelPath::new("checkpoints/a").unwrap().is_under(&folder));
        assert!(!RelPath::new("checkpoints2/a").unwrap().is_under(&folder));
    }

    #[test]
    fn strip_folder_rebases() {
        let folder = RelPath::new("old").unwrap();
        let p = RelPath::new("old/sub/f.bin").unwrap();
        assert_eq!(p.strip_folder(&folder).unwrap().as_str(), "sub/f.bin");
        assert!(RelPath::new("other/f.bin").unwrap().strip_folder(&folder).is_none());
    }
}
