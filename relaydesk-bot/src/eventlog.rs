//! Append-only operator log.
//!
//! One timestamped line per event, written to a plain-text file and mirrored
//! in a small in-memory ring for the dashboard. The file is never read back.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Offset, Utc};
use parking_lot::Mutex;

const RECENT_CAPACITY: usize = 200;

pub struct EventLog {
    path: Option<PathBuf>,
    offset: FixedOffset,
    recent: Mutex<VecDeque<String>>,
}

impl EventLog {
    /// Log to `path`, stamping lines in the given UTC offset (hours).
    /// Out-of-range offsets fall back to UTC.
    pub fn open(path: impl AsRef<Path>, utc_offset_hours: i32) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            offset: offset_from_hours(utc_offset_hours),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// Memory-only log.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            offset: offset_from_hours(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn record(&self, message: &str) {
        let stamp = Utc::now().with_timezone(&self.offset);
        let line = format!("[{}] {}", stamp.format("%Y-%m-%d %H:%M:%S"), message);

        // Lock order: ring first, then file, so lines land in the same order
        // in both.
        let mut recent = self.recent.lock();
        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &line) {
                tracing::warn!(path = %path.display(), error = %e, "could not write event log");
            }
        }
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(line);
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }
}

fn offset_from_hours(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
