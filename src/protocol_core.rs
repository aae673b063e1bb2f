//! Shared protocol logic for the client and server halves of the transport
//!
//! Frame headers, stream payload encoding and path confinement live here so
//! that both sides of `net_async` agree on them.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Resolve a requested path to a location safely under `root`.
///
/// 1. NUL bytes and parent directory components are rejected
/// 2. Root and prefix components are ignored, so "/a/b" means "<root>/a/b"
/// 3. The deepest existing ancestor is canonicalized to resolve symlinks
/// 4. The result must stay under the canonical root
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir | RootDir | Prefix(_) => {}
            Normal(s) => {
                // On Windows, reject components with ':' (ADS defense)
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir => bail!("path contains parent directory component"),
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty path");
    }

    let canon_root = root
        .canonicalize()
        .with_context(|| format!("canonicalize root {}", root.display()))?;
    let joined = canon_root.join(&safe);

    // Canonicalize the deepest entry that exists (a dangling symlink counts
    // and fails here), then append the components still to be created
    let mut existing = joined.as_path();
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut final_path = existing
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", existing, e))?;
    for name in missing.iter().rev() {
        final_path.push(name);
    }

    if !final_path.starts_with(&canon_root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }
    Ok(final_path)
}

/// Validate frame payload size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

/// Stream payload: id u32 | data
pub fn encode_stream(id: u32, data: &[u8]) -> Vec<u8> {
    let mut pl = Vec::with_capacity(4 + data.len());
    pl.extend_from_slice(&id.to_le_bytes());
    pl.extend_from_slice(data);
    pl
}

/// Split a stream payload into its id and the remaining bytes
pub fn split_stream(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        bail!("stream frame too short ({} bytes)", payload.len());
    }
    let id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((id, &payload[4..]))
}

/// Open payload: id u32 | path_len u16 | path bytes
pub fn encode_open(id: u32, path: &str) -> Result<Vec<u8>> {
    let bytes = path.as_bytes();
    if bytes.len() > u16::MAX as usize {
        bail!("path too long ({} bytes)", bytes.len());
    }
    let mut pl = Vec::with_capacity(4 + 2 + bytes.len());
    pl.extend_from_slice(&id.to_le_bytes());
    pl.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    pl.extend_from_slice(bytes);
    Ok(pl)
}

pub fn decode_open(payload: &[u8]) -> Result<(u32, String)> {
    let (id, rest) = split_stream(payload)?;
    if rest.len() < 2 {
        bail!("bad open payload");
    }
    let nlen = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    if rest.len() != 2 + nlen {
        bail!("bad open path length");
    }
    let path = std::str::from_utf8(&rest[2..]).context("open path is not UTF-8")?;
    Ok((id, path.to_string()))
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_under_root_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let canon = root.canonicalize().unwrap();

        let result = normalize_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert!(result.starts_with(&canon));
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(root, Path::new("./subdir/./file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));

        // Leading slash is relative to the served root
        let result = normalize_under_root(root, Path::new("/metadata.json")).unwrap();
        assert_eq!(result, canon.join("metadata.json"));
    }

    #[test]
    fn test_normalize_under_root_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(normalize_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("file\0.txt")).is_err());
        assert!(normalize_under_root(root, Path::new("/")).is_err());
        assert!(normalize_under_root(root, Path::new("")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_rejects_symlink_escape() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();

        assert!(normalize_under_root(temp_dir.path(), Path::new("link/secret.txt")).is_err());
        assert!(normalize_under_root(temp_dir.path(), Path::new("link/new.txt")).is_err());
        assert!(normalize_under_root(temp_dir.path(), Path::new("link/newdir/evil.txt")).is_err());
        assert!(normalize_under_root(temp_dir.path(), Path::new("link/a/b/c.txt")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_rejects_dangling_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("not-yet.txt");
        std::os::unix::fs::symlink(&target, temp_dir.path().join("trap.txt")).unwrap();

        assert!(normalize_under_root(temp_dir.path(), Path::new("trap.txt")).is_err());
        assert!(normalize_under_root(temp_dir.path(), Path::new("trap.txt/x")).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_normalize_new_nested_path_stays_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let canon = temp_dir.path().canonicalize().unwrap();
        fs::create_dir(temp_dir.path().join("shelf")).unwrap();

        let result = normalize_under_root(temp_dir.path(), Path::new("shelf/new/deeper/book.epub")).unwrap();
        assert_eq!(result, canon.join("shelf/new/deeper/book.epub"));
    }

    #[test]
    fn test_normalize_with_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let subdir = root.join("subdir");
        fs::create_dir(&subdir).unwrap();
        let file = subdir.join("file.txt");
        fs::write(&file, "test").unwrap();

        let result = normalize_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert_eq!(result, file.canonicalize().unwrap());
    }

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(crate::protocol::frame::DATA, 12345);
        let (t, len) = parse_frame_header(&header).unwrap();
        assert_eq!(t, crate::protocol::frame::DATA);
        assert_eq!(len, 12345);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(1, 100);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(1, 100);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_open_payload() {
        let pl = encode_open(7, "books/Moby Dick.epub").unwrap();
        let (id, path) = decode_open(&pl).unwrap();
        assert_eq!(id, 7);
        assert_eq!(path, "books/Moby Dick.epub");

        assert!(decode_open(&pl[..pl.len() - 1]).is_err());
        assert!(decode_open(&[1, 0]).is_err());
    }

    #[test]
    fn test_split_stream() {
        let pl = encode_stream(42, b"chunk");
        let (id, rest) = split_stream(&pl).unwrap();
        assert_eq!(id, 42);
        assert_eq!(rest, b"chunk");
        assert!(split_stream(&[0, 1]).is_err());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());
        ensure_parent_exists(&file_path).unwrap();
    }
}
