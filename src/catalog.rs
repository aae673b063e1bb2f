//! Server-side catalog maintenance
//!
//! The catalog is the `hash -> path` map a server publishes next to its books,
//! in the same file format as a device cache. Paths are relative to the
//! served root with `/` separators.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::cache::Cache;
use crate::digest::{self, DigestKind};
use crate::error::{Error, Result};

/// File extensions readers handle (compared case-insensitively)
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "epub", "kepub", "mobi", "pdf", "jpeg", "jpg", "gif", "png", "bmp", "tiff", "txt", "html",
    "rtf", "cbz", "cbr",
];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(e))
        })
        .unwrap_or(false)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// `a/b/c.epub` style path of `full` relative to `root`
fn relative_key(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    let parts = parts?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[derive(Debug, Default)]
pub struct IndexReport {
    /// (hash, path) of new entries
    pub added: Vec<(String, String)>,
    /// (path, path already holding the same content)
    pub duplicates: Vec<(String, String)>,
    /// (path, message)
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// (old hash, new hash, path)
    pub rekeyed: Vec<(String, String, String)>,
    /// (hash, path) of entries whose file is gone
    pub dropped: Vec<(String, String)>,
    /// (path, path already holding its new content); the entry is removed
    pub duplicates: Vec<(String, String)>,
    /// (path, message) for files that exist but could not be read; entries kept
    pub errors: Vec<(String, String)>,
}

pub struct Catalog {
    root: PathBuf,
    file: PathBuf,
    kind: DigestKind,
    entries: Cache,
}

impl Catalog {
    /// Load the catalog `name` under `root` (empty if it does not exist yet)
    pub fn open(root: impl Into<PathBuf>, name: &str, kind: DigestKind) -> Result<Self> {
        let root = root.into();
        let file = root.join(name);
        let entries = Cache::load(&file)?;
        Ok(Self {
            root,
            file,
            kind,
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn entries(&self) -> &Cache {
        &self.entries
    }

    pub fn save(&self) -> Result<()> {
        self.entries.save(&self.file)
    }

    /// Supported files under the root, as sorted catalog paths, plus the
    /// entries that could not be walked as `(path, message)`.
    /// Hidden entries and the catalog file itself are skipped.
    pub fn scan(&self) -> (Vec<String>, Vec<(String, String)>) {
        let mut found = Vec::new();
        let mut errors = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| {
                            relative_key(&self.root, p).unwrap_or_else(|| p.display().to_string())
                        })
                        .unwrap_or_else(|| self.root.display().to_string());
                    errors.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || entry.path() == self.file
                || !is_supported(entry.path())
            {
                continue;
            }
            if let Some(key) = relative_key(&self.root, entry.path()) {
                found.push(key);
            }
        }
        found.sort();
        (found, errors)
    }

    /// Hash supported files not yet in the catalog and add them.
    /// `threads` = 0 sizes the pool from the CPU count.
    pub fn index(&mut self, threads: usize) -> Result<IndexReport> {
        let known: std::collections::HashSet<&str> =
            self.entries.iter().map(|(_, p)| p.as_str()).collect();
        let (found, walk_errors) = self.scan();
        let fresh: Vec<String> = found
            .into_iter()
            .filter(|p| !known.contains(p.as_str()))
            .collect();

        let hashed = self.hash_all(&fresh, threads)?;
        let mut report = IndexReport {
            errors: walk_errors,
            ..IndexReport::default()
        };
        for (path, res) in hashed {
            match res {
                Ok(hash) => {
                    if let Some(existing) = self.entries.get(&hash) {
                        report.duplicates.push((path, existing.to_string()));
                    } else {
                        self.entries.insert(hash.clone(), path.clone());
                        report.added.push((hash, path));
                    }
                }
                Err(e) => report.errors.push((path, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Rehash every entry. Missing files are dropped and changed files are
    /// re-keyed; unreadable files keep their entry and are reported.
    ///
    /// The map is rebuilt from the new hashes. Entries whose content did not
    /// change (or could not be read) keep their key; a changed file whose new
    /// content is already held by another path is reported as a duplicate.
    pub fn refresh(&mut self, threads: usize) -> Result<RefreshReport> {
        let current: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(h, p)| (h.clone(), p.clone()))
            .collect();
        let paths: Vec<String> = current.iter().map(|(_, p)| p.clone()).collect();
        let hashed = self.hash_all(&paths, threads)?;

        let mut report = RefreshReport::default();
        let mut rebuilt = Cache::new();
        let mut changed: Vec<(String, String, String)> = Vec::new();
        for ((old, path), (_, res)) in current.into_iter().zip(hashed) {
            match res {
                Ok(new) if new == old => {
                    rebuilt.insert(old, path);
                }
                Ok(new) => changed.push((old, new, path)),
                Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                    report.dropped.push((old, path));
                }
                Err(e) => {
                    report.errors.push((path.clone(), e.to_string()));
                    rebuilt.insert(old, path);
                }
            }
        }

        changed.sort_by(|a, b| a.2.cmp(&b.2));
        for (old, new, path) in changed {
            if let Some(existing) = rebuilt.get(&new) {
                report.duplicates.push((path, existing.to_string()));
            } else {
                rebuilt.insert(new.clone(), path.clone());
                report.rekeyed.push((old, new, path));
            }
        }
        self.entries = rebuilt;
        Ok(report)
    }

    /// Drop an entry, optionally deleting its file. Returns the removed path.
    pub fn remove(&mut self, hash: &str, delete_file: bool) -> Result<Option<String>> {
        let Some(path) = self.entries.get(hash).map(str::to_string) else {
            return Ok(None);
        };
        if delete_file {
            let full = self.root.join(&path);
            match std::fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(full, e)),
            }
        }
        self.entries.remove(hash);
        Ok(Some(path))
    }

    /// `(hash, path)` pairs sorted by path
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut rows: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|(h, p)| (h.as_str(), p.as_str()))
            .collect();
        rows.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)));
        rows
    }

    fn hash_all(&self, paths: &[String], threads: usize) -> Result<Vec<(String, Result<String>)>> {
        let n = if threads == 0 { num_cpus::get() } else { threads };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| Error::Config(format!("hash pool: {}", e)))?;
        let kind = self.kind;
        let root = &self.root;
        Ok(pool.install(|| {
            paths
                .par_iter()
                .map(|p| (p.clone(), digest::file_digest(kind, &root.join(p))))
                .collect()
        }))
    }
}
