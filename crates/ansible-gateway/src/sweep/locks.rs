//! Stale session-lock reaper.
//!
//! Runs on every host (not coordinator-gated): session locks under
//! `agents/<agentId>/sessions/*.jsonl.lock` are expected to be
//! short-lived, so staleness is judged by file age alone. The owning PID
//! is extracted for the log line only — it is usually the long-running
//! host process itself, so PID liveness says nothing about whether the
//! lock is abandoned.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default reaper cadence.
pub const DEFAULT_EVERY_SECS: u64 = 60;

/// Default lock age before removal.
pub const DEFAULT_STALE_SECS: u64 = 300;

/// Directory depth searched below the session root.
const MAX_DEPTH: usize = 4;

/// Structured per-run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockSweepReport {
    pub found: usize,
    pub removed: usize,
    pub kept: usize,
    pub errors: usize,
}

/// Extract a PID from lock-file content: prefer `pid=<digits>`, else the
/// first integer of at least two digits.
#[must_use]
pub fn extract_pid(content: &str) -> Option<u64> {
    if let Some(index) = content.find("pid=") {
        let digits: String = content[index + 4..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
    }

    let mut current = String::new();
    for ch in content.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else {
            if current.len() >= 2 {
                return current.parse().ok();
            }
            current.clear();
        }
    }
    if current.len() >= 2 {
        return current.parse().ok();
    }
    None
}

/// Walk the session root and remove lock files older than `stale`.
#[must_use]
pub fn sweep_locks(root: &Path, stale: Duration, now: SystemTime) -> LockSweepReport {
    let mut report = LockSweepReport::default();
    if !root.exists() {
        return report;
    }

    for entry in WalkDir::new(root).max_depth(MAX_DEPTH) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "lock sweep walk error");
                report.errors += 1;
                continue;
            },
        };
        if !entry.file_type().is_file() || !is_lock_file(entry.path()) {
            continue;
        }
        report.found += 1;

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat lock");
                report.errors += 1;
                continue;
            },
        };
        let age = match metadata.modified() {
            Ok(mtime) => now.duration_since(mtime).unwrap_or(Duration::ZERO),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat lock");
                report.errors += 1;
                continue;
            },
        };

        let pid = std::fs::read_to_string(entry.path())
            .ok()
            .as_deref()
            .and_then(extract_pid);

        if age >= stale {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    warn!(
                        path = %entry.path().display(),
                        age_secs = age.as_secs(),
                        pid = ?pid,
                        "removed stale session lock"
                    );
                    report.removed += 1;
                },
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to remove lock");
                    report.errors += 1;
                },
            }
        } else {
            debug!(
                path = %entry.path().display(),
                age_secs = age.as_secs(),
                pid = ?pid,
                "keeping fresh session lock"
            );
            report.kept += 1;
        }
    }

    debug!(
        found = report.found,
        removed = report.removed,
        kept = report.kept,
        errors = report.errors,
        "lock sweep"
    );
    report
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".jsonl.lock"))
}

/// Run the reaper on its cadence until shutdown.
pub async fn run_lock_reaper(
    root: PathBuf,
    every: Duration,
    stale: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(every) => {
                let _ = sweep_locks(&root, stale, SystemTime::now());
            }
        }
    }
}
