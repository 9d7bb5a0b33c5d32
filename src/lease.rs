//! Lease locking for single-instance bootstrap runs.
//!
//! This module provides cross-process mutual exclusion over one graph root
//! using an atomically created lock file that the holder heartbeats.
//!
//! # Acquisition
//! - The lock record is written to a private temp file and hard-linked into
//!   place, which fails if the lock file exists: creation is exclusive and a
//!   reader never sees a half-written record
//! - A corrupt record is deleted and acquisition retried
//! - A record held by a live process blocks acquisition
//! - A record held by a dead process is stolen
//! - When liveness cannot be determined, the heartbeat age decides
//!
//! # Fail-open policy
//! If every attempt hits an unexpected I/O condition, `acquire` returns
//! `true` without holding the lock. The pipeline keeps running at the cost of
//! mutual exclusion under a pathological filesystem; this is logged at `warn`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{read_json_or_none, write_json_atomic, GraphPaths};

/// Heartbeat age after which a lock with indeterminate owner is stolen.
pub const LEASE_STALE_AFTER_SECS: i64 = 5 * 60;

const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    /// Fresh per acquisition; process ids alone can be reused by the OS.
    pub token: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockRecord {
    /// Creates a record for the current process with a new token.
    #[must_use]
    pub fn for_current_process() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the last heartbeat is older than `stale_after`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.updated_at) > stale_after
    }
}

/// Result of probing whether a process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe could not tell (e.g. permission denied).
    Unknown,
}

/// Probes whether `pid` refers to a running process.
#[cfg(unix)]
#[must_use]
pub fn probe_process(pid: u32) -> Liveness {
    if pid == std::process::id() {
        return Liveness::Alive;
    }
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Liveness::Dead;
    };
    if raw <= 0 {
        // 0 and negatives address process groups, never a single holder
        return Liveness::Dead;
    }

    // Signal 0 performs permission and existence checks without delivering anything.
    let result = unsafe { libc::kill(raw, 0) };
    if result == 0 {
        return Liveness::Alive;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Liveness::Dead,
        _ => Liveness::Unknown,
    }
}

/// Probes whether `pid` refers to a running process.
#[cfg(not(unix))]
#[must_use]
pub fn probe_process(pid: u32) -> Liveness {
    if pid == std::process::id() {
        Liveness::Alive
    } else {
        Liveness::Unknown
    }
}

/// What to do about an existing, readable lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Another holder is active.
    Contended,
    /// The record may be removed and acquisition retried.
    Steal,
}

/// Decides whether an existing record blocks acquisition.
#[must_use]
pub fn judge_record(
    record: &LockRecord,
    liveness: Liveness,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Verdict {
    match liveness {
        Liveness::Alive => Verdict::Contended,
        Liveness::Dead => Verdict::Steal,
        Liveness::Unknown if record.is_stale(now, stale_after) => Verdict::Steal,
        Liveness::Unknown => Verdict::Contended,
    }
}

enum Existing {
    Missing,
    Corrupt,
    Valid(LockRecord),
}

/// Lease lock manager.
///
/// Owns the registry of acquisition tokens held by this instance, so two
/// managers in one process never release or refresh each other's leases.
#[derive(Debug)]
pub struct LeaseLock {
    claims: Mutex<HashMap<PathBuf, String>>,
    stale_after: Duration,
}

impl Default for LeaseLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseLock {
    /// Creates a manager with the default five minute staleness threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stale_after(Duration::seconds(LEASE_STALE_AFTER_SECS))
    }

    /// Creates a manager with a custom staleness threshold.
    #[must_use]
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<PathBuf, String>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempts to take the lease for the graph at `root`.
    ///
    /// Returns `false` only when another live holder owns the lease. See the
    /// module docs for the fail-open policy.
    pub fn acquire(&self, root: &Path) -> bool {
        let lock_path = GraphPaths::new(root).lock_file();
        if let Err(err) = fs::create_dir_all(root) {
            tracing::warn!(root = %root.display(), error = %err, "cannot create graph root");
        }

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let record = LockRecord::for_current_process();
            match create_exclusive(&lock_path, &record) {
                Ok(()) => {
                    tracing::debug!(path = %lock_path.display(), attempt, "lease acquired");
                    self.claims().insert(root.to_path_buf(), record.token);
                    return true;
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    tracing::warn!(path = %lock_path.display(), attempt, error = %err, "lease create failed");
                    continue;
                }
            }

            match inspect(&lock_path) {
                Existing::Missing => {}
                Existing::Corrupt => {
                    tracing::warn!(path = %lock_path.display(), "removing corrupt lease record");
                    let _ = fs::remove_file(&lock_path);
                }
                Existing::Valid(existing) => {
                    let liveness = probe_process(existing.pid);
                    match judge_record(&existing, liveness, Utc::now(), self.stale_after) {
                        Verdict::Contended => {
                            tracing::debug!(pid = existing.pid, "lease held by another instance");
                            return false;
                        }
                        Verdict::Steal => {
                            tracing::warn!(
                                pid = existing.pid,
                                ?liveness,
                                heartbeat = %existing.updated_at,
                                "stealing abandoned lease"
                            );
                            remove_if_unchanged(&lock_path, &existing);
                        }
                    }
                }
            }
        }

        tracing::warn!(
            path = %lock_path.display(),
            attempts = MAX_ACQUIRE_ATTEMPTS,
            "lease acquisition kept failing; proceeding without mutual exclusion"
        );
        true
    }

    /// Releases the lease if, and only if, the on-disk record is still ours.
    ///
    /// Best-effort: failures are logged, never returned.
    pub fn release(&self, root: &Path) {
        let Some(token) = self.claims().remove(root) else {
            return;
        };
        let lock_path = GraphPaths::new(root).lock_file();
        match inspect(&lock_path) {
            Existing::Valid(record) if owns(&record, &token) => {
                if let Err(err) = fs::remove_file(&lock_path) {
                    tracing::warn!(path = %lock_path.display(), error = %err, "lease release failed");
                }
            }
            _ => tracing::debug!(path = %lock_path.display(), "lease no longer ours; nothing to release"),
        }
    }

    /// Heartbeats the lease so staleness reflects ongoing work.
    ///
    /// A lease that was stolen or released is never refreshed, and the stale
    /// claim is dropped. Best-effort like [`LeaseLock::release`].
    pub fn refresh(&self, root: &Path) {
        let Some(token) = self.claims().get(root).cloned() else {
            return;
        };
        let lock_path = GraphPaths::new(root).lock_file();
        match inspect(&lock_path) {
            Existing::Valid(mut record) if owns(&record, &token) => {
                let now = Utc::now();
                if now > record.updated_at {
                    record.updated_at = now;
                }
                if let Err(err) = write_json_atomic(&lock_path, &record) {
                    tracing::warn!(path = %lock_path.display(), error = %err, "lease refresh failed");
                }
            }
            _ => {
                tracing::warn!(path = %lock_path.display(), "lease lost; dropping claim");
                self.claims().remove(root);
            }
        }
    }

    /// Returns true if this manager holds a claim on `root`.
    #[must_use]
    pub fn holds(&self, root: &Path) -> bool {
        self.claims().contains_key(root)
    }

    /// Reads the current lock record for `root`, if any is readable.
    #[must_use]
    pub fn read_record(root: &Path) -> Option<LockRecord> {
        match inspect(&GraphPaths::new(root).lock_file()) {
            Existing::Valid(record) => Some(record),
            Existing::Missing | Existing::Corrupt => None,
        }
    }
}

fn owns(record: &LockRecord, token: &str) -> bool {
    record.pid == std::process::id() && record.token == token
}

fn inspect(lock_path: &Path) -> Existing {
    match read_json_or_none::<LockRecord>(lock_path) {
        Ok(Some(record)) => Existing::Valid(record),
        Ok(None) => Existing::Missing,
        Err(err) => {
            tracing::debug!(path = %lock_path.display(), error = %err, "unreadable lease record");
            Existing::Corrupt
        }
    }
}

/// Removes the lock file only if it still holds `expected`, narrowing the
/// window in which two stealers delete each other's fresh lease.
fn remove_if_unchanged(lock_path: &Path, expected: &LockRecord) {
    if let Existing::Valid(current) = inspect(lock_path) {
        if current.token == expected.token {
            let _ = fs::remove_file(lock_path);
        }
    }
}

fn create_exclusive(lock_path: &Path, record: &LockRecord) -> io::Result<()> {
    let content = serde_json::to_vec(record).map_err(io::Error::other)?;
    let parent = lock_path.parent().unwrap_or_else(|| Path::new("."));
    let staging = parent.join(format!(".lease-claim-{}-{}", record.pid, record.token));

    fs::write(&staging, &content)?;
    let linked = fs::hard_link(&staging, lock_path);
    let _ = fs::remove_file(&staging);

    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(err),
        Err(_) => {
            // No hard links on this filesystem: fall back to a plain exclusive create.
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)?;
            file.write_all(&content)?;
            file.sync_all()
        }
    }
}
