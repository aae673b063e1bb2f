//! Session configuration, read from `tortuga.toml`
//!
//! Everything a session needs (server address, credentials, the pinned host
//! identity and local paths) arrives through a [`Config`] value handed to the
//! session constructor.

use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::digest::DigestKind;
use crate::error::{Error, Result};
use crate::tls::normalize_fingerprint;
use crate::url::{parse_remote_addr, RemoteAddr};

pub const DEFAULT_CATALOG: &str = "metadata.json";
pub const DEFAULT_UPLOAD_DIR: &str = ".kraken";
pub const DEFAULT_HOME: &str = "/mnt/onboard";
pub const CACHE_FILE_NAME: &str = "tortuga.json";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub sync: SyncConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub address: String,
    pub token: String,
    pub host_fingerprint: String,
    pub catalog: String,
    pub upload_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: String::new(),
            host_fingerprint: String::new(),
            catalog: DEFAULT_CATALOG.to_string(),
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub home: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<PathBuf>, // defaults to <home>/tortuga.json
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(DEFAULT_HOME),
            cache: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_concurrent: usize, // 0 = unbounded
    pub checkpoint: bool,
    pub digest: DigestKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            checkpoint: true,
            digest: DigestKind::Md5,
        }
    }
}

impl Config {
    pub fn cache_path(&self) -> PathBuf {
        self.local
            .cache
            .clone()
            .unwrap_or_else(|| self.local.home.join(CACHE_FILE_NAME))
    }

    pub fn remote_addr(&self) -> Result<RemoteAddr> {
        if self.remote.address.trim().is_empty() {
            return Err(Error::Config("remote.address is not set".into()));
        }
        parse_remote_addr(&self.remote.address).ok_or_else(|| {
            Error::Config(format!("invalid remote.address {:?}", self.remote.address))
        })
    }

    /// Check the values a connecting session needs
    pub fn validate(&self) -> Result<()> {
        self.remote_addr()?;
        if self.remote.token.is_empty() {
            return Err(Error::Config("remote.token is not set".into()));
        }
        let fp = normalize_fingerprint(&self.remote.host_fingerprint);
        if fp.is_empty() {
            return Err(Error::Config(
                "remote.host_fingerprint is not set (see `tortuga keyscan`)".into(),
            ));
        }
        if !DigestKind::Sha256.is_digest(&fp) {
            return Err(Error::Config(format!(
                "remote.host_fingerprint is not a SHA-256 hex digest: {:?}",
                self.remote.host_fingerprint
            )));
        }
        if self.remote.catalog.is_empty() {
            return Err(Error::Config("remote.catalog is empty".into()));
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    crate::tls::config_dir().join("tortuga.toml")
}

/// Load a config file. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<Config> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(Error::io(path, e)),
    };
    toml::from_str(&data).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Atomically write a config file, readable only by its owner since it holds the token
pub fn save(cfg: &Config, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let data = toml::to_string(cfg).map_err(|e| Error::Config(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
    if let Err(e) = tmp.write_all(data.as_bytes()).and_then(|_| tmp.flush()) {
        return Err(Error::io(tmp.path(), e));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FP: &str = "3f:a1:00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd";

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.remote.catalog, "metadata.json");
        assert_eq!(cfg.remote.upload_dir, ".kraken");
        assert_eq!(cfg.sync.max_concurrent, 8);
        assert!(cfg.sync.checkpoint);
        assert_eq!(cfg.cache_path(), PathBuf::from("/mnt/onboard/tortuga.json"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("tortuga.toml");
        std::fs::write(
            &p,
            format!(
                "[remote]\naddress = \"books.lan\"\ntoken = \"s3cret\"\nhost_fingerprint = \"{}\"\n\n[local]\nhome = \"/tmp/reader\"\n\n[sync]\ndigest = \"blake3\"\nmax_concurrent = 0\n",
                FP
            ),
        )
        .unwrap();
        let cfg = load(&p).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.remote_addr().unwrap().port, 9031);
        assert_eq!(cfg.cache_path(), PathBuf::from("/tmp/reader/tortuga.json"));
        assert_eq!(cfg.sync.digest, DigestKind::Blake3);
        assert_eq!(cfg.sync.max_concurrent, 0);
        assert!(cfg.sync.checkpoint);
    }

    #[test]
    fn test_validate_reports_missing_values() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        cfg.remote.address = "books.lan:7000".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(m)) if m.contains("token")));
        cfg.remote.token = "t".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(m)) if m.contains("host_fingerprint")));
        cfg.remote.host_fingerprint = "abcd".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(m)) if m.contains("SHA-256")));
        cfg.remote.host_fingerprint = FP.into();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("tortuga.toml");
        std::fs::write(&p, "[sync]\nmax_concurrent = \"many\"\n").unwrap();
        assert!(matches!(load(&p), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("conf/tortuga.toml");
        let mut cfg = Config::default();
        cfg.remote.address = "tortuga://books.lan:7000".into();
        cfg.remote.host_fingerprint = FP.into();
        cfg.local.cache = Some(PathBuf::from("/var/tortuga.json"));
        save(&cfg, &p).unwrap();
        assert_eq!(load(&p).unwrap(), cfg);
    }
}
