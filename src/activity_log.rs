//! Append-only textual business-event sink (`data/server.log`).
//!
//! Separate from the `tracing` diagnostic stream: this file is for operators
//! to `tail` for user-facing events, not for debugging the process itself.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

pub struct ActivityLog {
    path: Mutex<PathBuf>,
}

impl ActivityLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: Mutex::new(data_dir.join("server.log")),
        }
    }

    /// Appends one `[YYYY-MM-DD HH:MM:SS] <event>` line. Failures are logged
    /// via `tracing` and otherwise swallowed — losing an activity-log line
    /// must never fail the request that triggered it.
    pub fn record(&self, event: &str) {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let line = format!("[{}] {event}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "failed to create data directory for activity log");
                return;
            }
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append to activity log");
        }
    }
}
