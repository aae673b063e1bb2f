//! Content digests used as cache keys
//!
//! A digest is a dedup/integrity key, not a trust anchor. MD5 is the default
//! because published catalogs are keyed by it.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 64 * 1024; // 64KB reads

/// Available digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    Md5, // Catalog compatibility
    Sha256,
    Blake3,
}

impl Default for DigestKind {
    fn default() -> Self {
        Self::Md5
    }
}

impl DigestKind {
    /// Length of the lowercase hex encoding
    pub fn hex_len(self) -> usize {
        match self {
            DigestKind::Md5 => 32,
            DigestKind::Sha256 | DigestKind::Blake3 => 64,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            DigestKind::Md5 => Hasher::Md5(md5::Context::new()),
            DigestKind::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestKind::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Whether `s` looks like a digest of this kind (lowercase hex, right length)
    pub fn is_digest(self, s: &str) -> bool {
        s.len() == self.hex_len() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestKind::Md5 => "md5",
            DigestKind::Sha256 => "sha256",
            DigestKind::Blake3 => "blake3",
        })
    }
}

impl FromStr for DigestKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestKind::Md5),
            "sha256" | "sha-256" => Ok(DigestKind::Sha256),
            "blake3" => Ok(DigestKind::Blake3),
            other => Err(format!("unknown digest '{}' (expected md5, sha256 or blake3)", other)),
        }
    }
}

/// Incremental hasher over any of the supported algorithms
pub enum Hasher {
    Md5(md5::Context),
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(c) => c.consume(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(c) => format!("{:x}", c.compute()),
            Hasher::Sha256(h) => to_hex(&h.finalize()),
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Digest of an in-memory buffer
pub fn digest_bytes(kind: DigestKind, data: &[u8]) -> String {
    let mut h = kind.hasher();
    h.update(data);
    h.finalize_hex()
}

/// Digest of everything readable from `r`
pub fn digest_reader<R: Read>(kind: DigestKind, mut r: R) -> std::io::Result<String> {
    let mut h = kind.hasher();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finalize_hex())
}

/// Digest of the bytes currently stored at `path`, read from scratch
pub fn file_digest(kind: DigestKind, path: &Path) -> Result<String> {
    let f = File::open(path).map_err(|e| Error::io(path, e))?;
    digest_reader(kind, f).map_err(|e| Error::io(path, e))
}
