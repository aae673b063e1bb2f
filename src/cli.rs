//! Command line surfaces of `tortuga` (device) and `tortugad` (server)

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::digest::DigestKind;

/// Sync e-books from a tortugad server into a reader's library
#[derive(Clone, Debug, Parser)]
#[command(name = "tortuga", version)]
pub struct DeviceOpts {
    /// Config file (default: ~/.config/tortuga/tortuga.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address, overrides remote.address
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Local library directory, overrides local.home
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Local cache file, overrides local.cache
    #[arg(long, global = true)]
    pub cache: Option<PathBuf>,

    /// Parallel transfers (0 = unbounded)
    #[arg(short = 'j', long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Only write the cache when the session closes
    #[arg(long, global = true)]
    pub no_checkpoint: bool,

    /// Show a progress bar
    #[arg(short, long, global = true)]
    pub progress: bool,

    /// List each file as it is fetched
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append session events to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<DeviceCommand>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DeviceCommand {
    /// Fetch every catalog entry missing locally (default)
    Sync,
    /// Print what a sync would fetch
    Diff,
    /// Push local files into the server's upload directory
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Remote directory, overrides remote.upload_dir
        #[arg(long)]
        remote_dir: Option<String>,
    },
    /// Check local cache entries against the files they point at
    Audit,
    /// Print the certificate fingerprint a server presents
    Keyscan {
        address: String,
        /// Store the address and fingerprint in the config file
        #[arg(long)]
        save: bool,
    },
}

impl DeviceOpts {
    /// Fold command line overrides into a loaded config
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(a) = &self.address {
            cfg.remote.address = a.clone();
        }
        if let Some(h) = &self.home {
            cfg.local.home = h.clone();
        }
        if let Some(c) = &self.cache {
            cfg.local.cache = Some(c.clone());
        }
        if let Some(n) = self.max_concurrent {
            cfg.sync.max_concurrent = n;
        }
        if self.no_checkpoint {
            cfg.sync.checkpoint = false;
        }
        if let Some(DeviceCommand::Upload {
            remote_dir: Some(d),
            ..
        }) = &self.command
        {
            cfg.remote.upload_dir = d.clone();
        }
    }
}

/// Serve an e-book library to tortuga devices
#[derive(Clone, Debug, Parser)]
#[command(name = "tortugad", version)]
pub struct DaemonCli {
    #[command(subcommand)]
    pub command: DaemonCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DaemonCommand {
    /// Serve a library root over TLS
    Serve(DaemonOpts),
    /// Print the fingerprint devices should pin
    Fingerprint {
        /// Certificate PEM (default: the generated one)
        #[arg(long)]
        tls_cert: Option<PathBuf>,
    },
    /// Maintain the published catalog
    Catalog(CatalogOpts),
}

#[derive(Clone, Debug, Args)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9031")]
    pub bind: String,

    /// Root directory to serve
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Shared token devices must present
    #[arg(long)]
    pub token: String,

    /// Certificate PEM (default: self-signed, generated on first run)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Private key PEM matching --tls-cert
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct CatalogOpts {
    /// Library root
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Catalog file name under the root
    #[arg(long, default_value = "metadata.json")]
    pub name: String,

    /// Digest used for keys
    #[arg(long, default_value = "md5")]
    pub digest: DigestKind,

    /// Hashing threads (0 = one per CPU)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    #[command(subcommand)]
    pub action: CatalogAction,
}

#[derive(Clone, Debug, Subcommand)]
pub enum CatalogAction {
    /// Add supported files that are not in the catalog yet
    Index,
    /// Rehash entries: drop missing files, re-key changed ones
    Refresh,
    /// Drop an entry
    Remove {
        hash: String,
        /// Also delete the file
        #[arg(long)]
        delete_file: bool,
    },
    /// Print `hash  path` lines
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_device_cli_is_consistent() {
        DeviceOpts::command().debug_assert();
        DaemonCli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply() {
        let opts = DeviceOpts::parse_from([
            "tortuga",
            "--home",
            "/tmp/reader",
            "-j",
            "0",
            "--no-checkpoint",
            "upload",
            "notes.html",
            "--remote-dir",
            "inbox",
        ]);
        let mut cfg = Config::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg.local.home, PathBuf::from("/tmp/reader"));
        assert_eq!(cfg.sync.max_concurrent, 0);
        assert!(!cfg.sync.checkpoint);
        assert_eq!(cfg.remote.upload_dir, "inbox");
        assert_eq!(cfg.remote.catalog, "metadata.json");
    }

    #[test]
    fn test_default_command_is_none() {
        let opts = DeviceOpts::parse_from(["tortuga", "--progress"]);
        assert!(opts.command.is_none());
        assert!(opts.progress);
    }

    #[test]
    fn test_catalog_args() {
        let cli = DaemonCli::parse_from([
            "tortugad", "catalog", "--root", "/srv/books", "--digest", "blake3", "remove", "abc",
            "--delete-file",
        ]);
        match cli.command {
            DaemonCommand::Catalog(c) => {
                assert_eq!(c.digest, DigestKind::Blake3);
                assert!(matches!(c.action, CatalogAction::Remove { ref hash, delete_file: true } if hash == "abc"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
