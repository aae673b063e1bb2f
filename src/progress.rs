//! Console progress for device runs
//!
//! Fetched and failed files scroll above a status bar that stays at the
//! bottom, cargo style. The reporter is a [`Logger`], so it is driven by the
//! same events as the log file.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::logger::Logger;

pub struct SyncProgress {
    bar: ProgressBar,
    start_time: Instant,
    bytes: AtomicU64,
    show_files: bool,
}

impl SyncProgress {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message("Connecting");
        Self {
            bar,
            start_time: Instant::now(),
            bytes: AtomicU64::new(0),
            show_files: verbose,
        }
    }

    fn print_op(&self, operation: &str, color: Color, path: &str) {
        self.bar.suspend(|| {
            eprintln!("  {} {}", operation.with(color).bold(), path.with(Color::Cyan));
        });
    }

    fn refresh_message(&self) {
        let secs = self.start_time.elapsed().as_secs_f64();
        let mb = self.bytes.load(Ordering::Relaxed) as f64 / 1_048_576.0;
        let rate = if secs > 0.1 {
            format!(" @ {:.1} MB/s", mb / secs)
        } else {
            String::new()
        };
        self.bar
            .set_message(format!("{} {:.1} MB{}", "Fetching".with(Color::Green).bold(), mb, rate));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

impl Logger for SyncProgress {
    fn start(&self, _session: &Uuid, remote: &str) {
        self.bar.set_message(format!(
            "{} {}",
            "Connected".with(Color::Green).bold(),
            remote
        ));
    }

    fn planned(&self, items: u64) {
        if items == 0 {
            return;
        }
        self.bar.set_length(items);
        self.bar.set_position(0);
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        self.refresh_message();
    }

    fn fetched(&self, remote: &str, _local: &Path, _hash: &str, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if self.show_files {
            self.print_op("Fetched", Color::Green, remote);
        }
        self.bar.inc(1);
        self.refresh_message();
    }

    fn uploaded(&self, local: &Path, remote: &str, _bytes: u64) {
        self.print_op(
            "Uploaded",
            Color::Green,
            &format!("{} -> {}", local.display(), remote),
        );
    }

    fn error(&self, context: &str, path: &str, msg: &str) {
        // Mismatch notices are informational; the entry is still recorded
        if context == "verify" {
            if self.show_files {
                self.print_op("Rehashed", Color::Yellow, path);
            }
            return;
        }
        self.print_op("Failed", Color::Red, &format!("{} ({})", path, msg));
        if context == "fetch" {
            self.bar.inc(1);
        }
    }

    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        let mb = bytes as f64 / 1_048_576.0;
        let rate = if seconds > 0.0 { mb / seconds } else { 0.0 };
        self.bar.finish_with_message(format!(
            "{} {} files ({:.1} MB) in {:.1}s ({:.1} MB/s)",
            "Completed".with(Color::Green).bold(),
            files,
            mb,
            seconds,
            rate
        ));
    }
}
