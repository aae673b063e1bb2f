use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use tortuga::bay::Bay;
use tortuga::cache::{self, Cache, Staleness};
use tortuga::cli::{DeviceCommand, DeviceOpts};
use tortuga::config::{self, Config};
use tortuga::logger::{Fanout, Logger, TextLogger};
use tortuga::net_async::client::keyscan;
use tortuga::progress::SyncProgress;
use tortuga::url::parse_remote_addr;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Files fetched so far are already recorded.");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = DeviceOpts::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let code = rt.block_on(run(opts))?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

struct Reporting {
    logger: Arc<dyn Logger>,
    progress: Option<Arc<SyncProgress>>,
}

impl Reporting {
    fn new(opts: &DeviceOpts) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn Logger>> = Vec::new();
        if let Some(p) = &opts.log_file {
            let text = TextLogger::new(p)
                .with_context(|| format!("open log file {}", p.display()))?;
            sinks.push(Arc::new(text));
        }
        let progress = opts.progress.then(|| Arc::new(SyncProgress::new(opts.verbose)));
        if let Some(p) = &progress {
            sinks.push(p.clone());
        }
        Ok(Self {
            logger: Arc::new(Fanout(sinks)),
            progress,
        })
    }

    fn failed(&self, msg: &str) {
        if let Some(p) = &self.progress {
            p.finish_error(msg);
        }
    }
}

async fn run(opts: DeviceOpts) -> Result<i32> {
    let cfg_path = opts.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = config::load(&cfg_path)?;
    opts.apply(&mut cfg);

    match opts.command.clone().unwrap_or(DeviceCommand::Sync) {
        DeviceCommand::Keyscan { address, save } => run_keyscan(&address, save, &cfg_path).await,
        DeviceCommand::Audit => run_audit(&cfg),
        DeviceCommand::Diff => run_diff(cfg).await,
        DeviceCommand::Sync => {
            let reporting = Reporting::new(&opts)?;
            let res = run_sync(cfg, &reporting, opts.verbose).await;
            if let Err(e) = &res {
                reporting.failed(&e.to_string());
            }
            res
        }
        DeviceCommand::Upload { files, .. } => {
            let reporting = Reporting::new(&opts)?;
            run_upload(cfg, &reporting, &files).await
        }
    }
}

async fn run_sync(cfg: Config, reporting: &Reporting, verbose: bool) -> Result<i32> {
    let mut bay = Bay::connect(cfg, reporting.logger.clone()).await?;
    let report = match bay.import_all().await {
        Ok(r) => r,
        Err(e) => {
            // The import error is the one worth reporting
            let _ = bay.close().await;
            return Err(e.into());
        }
    };
    let closed = bay.close().await;

    if reporting.progress.is_none() {
        if verbose {
            for f in &report.fetched {
                println!("  fetched {} -> {}", f.remote, f.local.display());
            }
        }
        println!(
            "Fetched {} files ({:.1} MB)",
            report.fetched.len(),
            report.bytes() as f64 / 1_048_576.0
        );
    }
    if !report.errors.is_empty() {
        eprintln!("{} items failed and will be retried next run:", report.errors.len());
        for e in report.errors.iter() {
            eprintln!("  {}", e);
        }
    }
    closed.context("closing session")?;
    Ok(if report.is_success() { 0 } else { 1 })
}

async fn run_diff(cfg: Config) -> Result<i32> {
    let mut bay = Bay::connect(cfg, Arc::new(tortuga::logger::NoopLogger)).await?;
    let pending = bay.diff().await;
    bay.close().await?;
    let pending: Cache = pending?;

    let mut rows: Vec<(&String, &String)> = pending.iter().collect();
    rows.sort_by(|a, b| a.1.cmp(b.1));
    for (hash, path) in &rows {
        println!("{}  {}", hash, path);
    }
    eprintln!("{} files to fetch", rows.len());
    Ok(0)
}

async fn run_upload(cfg: Config, reporting: &Reporting, files: &[std::path::PathBuf]) -> Result<i32> {
    let mut bay = Bay::connect(cfg, reporting.logger.clone()).await?;
    let mut failed = 0;
    for local in files {
        let Some(remote) = bay.upload_destination(local) else {
            eprintln!("skipping {}: no usable file name", local.display());
            failed += 1;
            continue;
        };
        match bay.upload(local, &remote).await {
            Ok(bytes) => {
                if reporting.progress.is_none() {
                    println!("uploaded {} -> {} ({} bytes)", local.display(), remote, bytes);
                }
            }
            Err(e) => {
                eprintln!("upload {}: {}", local.display(), e);
                failed += 1;
                if e.is_fatal() {
                    break;
                }
            }
        }
    }
    bay.close().await.context("closing session")?;
    Ok(if failed == 0 { 0 } else { 1 })
}

fn run_audit(cfg: &Config) -> Result<i32> {
    let cache_path = cfg.cache_path();
    let local = Cache::load(&cache_path)?;
    let stale = cache::audit(&local, &cfg.local.home, cfg.sync.digest);
    for entry in &stale {
        match &entry.reason {
            Staleness::Missing => println!("missing   {}  {}", entry.hash, entry.path),
            Staleness::Mismatch { actual } => {
                println!("changed   {}  {} (now {})", entry.hash, entry.path, actual)
            }
            Staleness::Unreadable(msg) => {
                println!("unreadable {}  {} ({})", entry.hash, entry.path, msg)
            }
        }
    }
    println!(
        "{} entries in {}, {} stale",
        local.len(),
        cache_path.display(),
        stale.len()
    );
    Ok(if stale.is_empty() { 0 } else { 1 })
}

async fn run_keyscan(address: &str, save: bool, cfg_path: &Path) -> Result<i32> {
    let addr = parse_remote_addr(address)
        .with_context(|| format!("invalid server address {:?}", address))?;
    let fp = keyscan(&addr).await?;
    println!("{}  {}", addr, fp);
    if save {
        // Start from the file as written, not the command line overrides
        let mut stored = config::load(cfg_path)?;
        stored.remote.address = address.to_string();
        stored.remote.host_fingerprint = fp;
        config::save(&stored, cfg_path)?;
        eprintln!("pinned {} in {}", addr, cfg_path.display());
    }
    Ok(0)
}
