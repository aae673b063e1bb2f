use anyhow::{Context, Result};
use clap::Parser;

use tortuga::catalog::Catalog;
use tortuga::cli::{CatalogAction, CatalogOpts, DaemonCli, DaemonCommand, DaemonOpts};
use tortuga::tls;

fn main() -> Result<()> {
    let cli = DaemonCli::parse();
    match cli.command {
        DaemonCommand::Serve(opts) => serve(opts),
        DaemonCommand::Fingerprint { tls_cert } => {
            let cert = tls_cert.unwrap_or_else(|| tls::default_server_cert_paths().0);
            let fp = tls::fingerprint_of_pem(&cert)
                .with_context(|| format!("read certificate {}", cert.display()))?;
            println!("{}", fp);
            Ok(())
        }
        DaemonCommand::Catalog(opts) => catalog(opts),
    }
}

fn serve(opts: DaemonOpts) -> Result<()> {
    // Validate root directory exists and is a directory
    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }
    if opts.token.is_empty() {
        anyhow::bail!("Error: --token must not be empty");
    }

    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    println!("Starting tortugad:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", opts.bind);

    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the library on all network interfaces");
        eprintln!("   Consider binding to a specific interface (e.g., 192.168.1.100:9031)");
    }

    let cert_path = match &opts.tls_cert {
        Some(p) => {
            println!("  Certificate: {}", p.display());
            p.clone()
        }
        None => {
            let (cert, _) = tls::default_server_cert_paths();
            println!("  Certificate: {} (self-signed)", cert.display());
            cert
        }
    };
    let tls_config = tls::load_or_generate_server_config(opts.tls_cert.clone(), opts.tls_key.clone())
        .context("Failed to set up TLS configuration")?;
    let fp = tls::fingerprint_of_pem(&cert_path)?;
    println!("  Fingerprint: {}", fp);
    println!("  (set remote.host_fingerprint to this value on each device)");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(tortuga::net_async::server::serve_with_tls(
        &opts.bind,
        &canonical_root,
        &opts.token,
        tls_config,
    ))
}

fn catalog(opts: CatalogOpts) -> Result<()> {
    let mut cat = Catalog::open(&opts.root, &opts.name, opts.digest)?;
    match opts.action {
        CatalogAction::Index => {
            let report = cat.index(opts.threads)?;
            for (hash, path) in &report.added {
                println!("added     {}  {}", hash, path);
            }
            for (path, existing) in &report.duplicates {
                println!("duplicate {} (same content as {})", path, existing);
            }
            for (path, msg) in &report.errors {
                eprintln!("error     {}: {}", path, msg);
            }
            cat.save()?;
            println!(
                "{} added, {} entries in {}",
                report.added.len(),
                cat.entries().len(),
                cat.path().display()
            );
        }
        CatalogAction::Refresh => {
            let report = cat.refresh(opts.threads)?;
            for (old, new, path) in &report.rekeyed {
                println!("rekeyed   {} -> {}  {}", old, new, path);
            }
            for (hash, path) in &report.dropped {
                println!("dropped   {}  {}", hash, path);
            }
            for (path, existing) in &report.duplicates {
                println!("duplicate {} (same content as {})", path, existing);
            }
            for (path, msg) in &report.errors {
                eprintln!("error     {}: {}", path, msg);
            }
            cat.save()?;
            println!(
                "{} rekeyed, {} dropped, {} entries in {}",
                report.rekeyed.len(),
                report.dropped.len(),
                cat.entries().len(),
                cat.path().display()
            );
        }
        CatalogAction::Remove { hash, delete_file } => match cat.remove(&hash, delete_file)? {
            Some(path) => {
                cat.save()?;
                println!("removed   {}  {}", hash, path);
            }
            None => anyhow::bail!("no catalog entry for {}", hash),
        },
        CatalogAction::List => {
            for (hash, path) in cat.list() {
                println!("{}  {}", hash, path);
            }
        }
    }
    Ok(())
}
