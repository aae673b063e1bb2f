use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub trait Logger: Send + Sync {
    fn start(&self, _session: &Uuid, _remote: &str) {}
    fn planned(&self, _items: u64) {}
    fn fetched(&self, _remote: &str, _local: &Path, _hash: &str, _bytes: u64) {}
    fn uploaded(&self, _local: &Path, _remote: &str, _bytes: u64) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, session: &Uuid, remote: &str) {
        self.line(&format!("START session={} remote={}", session, remote));
    }
    fn planned(&self, items: u64) {
        self.line(&format!("PLAN items={items}"));
    }
    fn fetched(&self, remote: &str, local: &Path, hash: &str, bytes: u64) {
        self.line(&format!(
            "FETCH remote={} local={} hash={} bytes={}",
            remote,
            local.display(),
            hash,
            bytes
        ));
    }
    fn uploaded(&self, local: &Path, remote: &str, bytes: u64) {
        self.line(&format!(
            "UPLOAD local={} remote={} bytes={}",
            local.display(),
            remote,
            bytes
        ));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Forwards every event to each inner logger in order
pub struct Fanout(pub Vec<Arc<dyn Logger>>);

impl Logger for Fanout {
    fn start(&self, session: &Uuid, remote: &str) {
        self.0.iter().for_each(|l| l.start(session, remote));
    }
    fn planned(&self, items: u64) {
        self.0.iter().for_each(|l| l.planned(items));
    }
    fn fetched(&self, remote: &str, local: &Path, hash: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.fetched(remote, local, hash, bytes));
    }
    fn uploaded(&self, local: &Path, remote: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.uploaded(local, remote, bytes));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.0.iter().for_each(|l| l.error(context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.0.iter().for_each(|l| l.done(files, bytes, seconds));
    }
}
