//! Content-addressed cache: digest -> path
//!
//! The same shape serves as the device's local cache and as the catalog a
//! server publishes. Identity is by digest only; paths are payload.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::digest::{self, DigestKind};
use crate::error::{Error, Result};

/// Mapping from lowercase hex digest to file path.
///
/// Backed by a `BTreeMap` so that serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cache(BTreeMap<String, String>);

impl Cache {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Read and parse the cache file at `path`.
    ///
    /// A missing file is the first-run state and yields an empty cache. Any
    /// other read failure is `Error::Io`, malformed content is `Error::Parse`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(Error::io(path, e)),
        };
        Self::from_json(&bytes, &path.display().to_string())
    }

    /// Parse a JSON object of digest -> path. `origin` names the source in errors.
    pub fn from_json(bytes: &[u8], origin: &str) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| Error::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Pretty-printed JSON with sorted keys
    pub fn to_json(&self) -> Vec<u8> {
        // A map of strings always serializes.
        serde_json::to_vec_pretty(&self.0).unwrap_or_default()
    }

    /// Write the cache to `path`, replacing prior content.
    ///
    /// The file is written to a sibling temp file and renamed into place, so a
    /// failed write leaves the previous content intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
        tmp.write_all(&self.to_json())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.flush())
            .map_err(|e| Error::io(tmp.path(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644));
        }
        tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
        Ok(())
    }

    /// Entries of `self` whose digest is absent from `local`.
    ///
    /// One-directional: local-only entries are never reported, and an entry
    /// present on both sides is excluded even when the paths differ.
    pub fn diff(&self, local: &Cache) -> Cache {
        self.0
            .iter()
            .filter(|(hash, _)| !local.0.contains_key(*hash))
            .map(|(h, p)| (h.clone(), p.clone()))
            .collect()
    }

    pub fn insert(&mut self, hash: impl Into<String>, path: impl Into<String>) -> Option<String> {
        self.0.insert(hash.into(), path.into())
    }

    pub fn remove(&mut self, hash: &str) -> Option<String> {
        self.0.remove(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&str> {
        self.0.get(hash).map(String::as_str)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.0.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Free-function form of [`Cache::diff`]: remote minus local.
pub fn diff(remote: &Cache, local: &Cache) -> Cache {
    remote.diff(local)
}

impl FromIterator<(String, String)> for Cache {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Cache {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .collect(),
        )
    }
}

impl IntoIterator for Cache {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Cache {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A cache bound to its backing file, shared across concurrent fetch tasks.
///
/// All access goes through one mutex: inserts and disk writes are serialized
/// against each other, so a checkpoint never observes a half-applied insert.
pub struct CacheStore {
    path: PathBuf,
    entries: Mutex<Cache>,
}

impl CacheStore {
    /// Load the cache at `path` (empty if the file does not exist yet).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = Cache::load(&path)?;
        Ok(Self::with_cache(path, cache))
    }

    pub fn with_cache(path: impl Into<PathBuf>, cache: Cache) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(cache),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, hash: impl Into<String>, path: impl Into<String>) -> Option<String> {
        self.entries.lock().insert(hash, path)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Cache {
        self.entries.lock().clone()
    }

    /// Entries of `remote` not yet held here
    pub fn missing_from(&self, remote: &Cache) -> Cache {
        remote.diff(&self.entries.lock())
    }

    /// Write the current entries to the backing file.
    ///
    /// The lock is held for the whole write. On failure the in-memory entries
    /// are untouched and the caller may retry.
    pub fn persist(&self) -> Result<()> {
        let guard = self.entries.lock();
        guard.save(&self.path)
    }

    /// Insert and immediately write the cache, under one lock acquisition.
    ///
    /// The insert stands even when the write fails.
    pub fn insert_and_persist(&self, hash: impl Into<String>, path: impl Into<String>) -> Result<()> {
        let mut guard = self.entries.lock();
        guard.insert(hash, path);
        guard.save(&self.path)
    }
}

/// Why a cache entry no longer describes the file it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Missing,
    Mismatch { actual: String },
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleEntry {
    pub hash: String,
    pub path: String,
    pub reason: Staleness,
}

/// Re-hash every entry and report the ones whose file is gone or changed.
///
/// Read-only: nothing is removed from the cache. Relative paths are resolved
/// against `base`.
pub fn audit(cache: &Cache, base: &Path, kind: DigestKind) -> Vec<StaleEntry> {
    let mut stale = Vec::new();
    for (hash, path) in cache {
        let full = base.join(path);
        let reason = match digest::file_digest(kind, &full) {
            Ok(actual) if &actual == hash => continue,
            Ok(actual) => Staleness::Mismatch { actual },
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Staleness::Missing
            }
            Err(e) => Staleness::Unreadable(e.to_string()),
        };
        stale.push(StaleEntry {
            hash: hash.clone(),
            path: path.clone(),
            reason,
        });
    }
    stale
}
