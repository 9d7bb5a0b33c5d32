//! Persisted, resumable bootstrap progress.
//!
//! Transitions are pure: each takes the current state by reference and
//! returns the next one, so a worker can never half-apply an update.
//!
//! # Cursor rule
//! `cursor` is the smallest batch index in `[0, total)` absent from the
//! completed set. Out-of-order completions past a gap do not move it, which
//! makes concurrent completion order irrelevant.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::{read_json_or_none, read_text_or_none, write_json_atomic, GraphPaths};

/// Current on-disk schema version.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Heartbeat age after which a `running` state is treated as crashed.
pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 5 * 60;

/// Lifecycle of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Running,
    /// Per-run batch budget exhausted with work remaining.
    Paused,
    Completed,
    Failed,
}

/// Outcome of one batch, fed to [`BootstrapState::advance_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub chunk_count: usize,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl BatchResult {
    #[must_use]
    pub const fn success(chunk_count: usize) -> Self {
        Self {
            chunk_count,
            succeeded: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(chunk_count: usize, error: impl Into<String>) -> Self {
        Self {
            chunk_count,
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// Bootstrap progress record, one per graph root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapState {
    pub version: u32,
    pub status: BootstrapStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cursor: usize,
    pub total: usize,
    /// Chunks ingested successfully.
    pub succeeded: usize,
    /// Chunks whose batch failed.
    pub failed: usize,
    /// Completed batch indices; cleared on finalize.
    #[serde(rename = "done", default)]
    pub completed: BTreeSet<usize>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub maintenance_completed: bool,
}

impl BootstrapState {
    /// Fresh running state for `total_batches` batches.
    #[must_use]
    pub fn initial(total_batches: usize) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_SCHEMA_VERSION,
            status: BootstrapStatus::Running,
            started_at: now,
            updated_at: now,
            cursor: 0,
            total: total_batches,
            succeeded: 0,
            failed: 0,
            completed: BTreeSet::new(),
            last_error: None,
            maintenance_completed: false,
        }
    }

    /// Records a finished batch and recomputes the cursor.
    ///
    /// Recording the same index twice is a no-op, so a replayed completion
    /// never double counts chunks. Indices outside `[0, total)` are ignored.
    #[must_use]
    pub fn advance_batch(&self, batch_index: usize, result: &BatchResult) -> Self {
        let mut next = self.clone();
        next.touch();
        if batch_index >= next.total || !next.completed.insert(batch_index) {
            return next;
        }

        if result.succeeded {
            next.succeeded = next.succeeded.saturating_add(result.chunk_count);
        } else {
            next.failed = next.failed.saturating_add(result.chunk_count);
            next.last_error = Some(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("batch {batch_index} failed")),
            );
        }
        next.cursor = contiguous_prefix(&next.completed, next.total);
        next
    }

    /// Puts a paused, failed or stale state back into `running`.
    #[must_use]
    pub fn resume(&self) -> Self {
        let mut next = self.clone();
        next.status = BootstrapStatus::Running;
        next.touch();
        next
    }

    /// Marks the run paused so the next tick can resume it.
    #[must_use]
    pub fn pause(&self) -> Self {
        let mut next = self.clone();
        next.status = BootstrapStatus::Paused;
        next.touch();
        next
    }

    /// Marks the run failed without discarding completed batches.
    #[must_use]
    pub fn fail(&self, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.status = BootstrapStatus::Failed;
        next.last_error = Some(error.into());
        next.touch();
        next
    }

    /// Closes the run.
    ///
    /// Completed if any chunk succeeded or there was nothing to do, failed
    /// otherwise. The completed set is cleared to bound the file size.
    #[must_use]
    pub fn finalize(&self) -> Self {
        let mut next = self.clone();
        next.status = if next.succeeded > 0 || next.total == 0 {
            BootstrapStatus::Completed
        } else {
            BootstrapStatus::Failed
        };
        next.completed.clear();
        next.cursor = next.total;
        next.touch();
        next
    }

    /// Records that post-bootstrap maintenance ran.
    #[must_use]
    pub fn with_maintenance_completed(&self) -> Self {
        let mut next = self.clone();
        next.maintenance_completed = true;
        next.touch();
        next
    }

    /// Refreshes the heartbeat.
    #[must_use]
    pub fn heartbeat(&self) -> Self {
        let mut next = self.clone();
        next.touch();
        next
    }

    /// Batches not yet completed.
    #[must_use]
    pub fn remaining(&self) -> Vec<usize> {
        (0..self.total)
            .filter(|index| !self.completed.contains(index))
            .collect()
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

fn contiguous_prefix(completed: &BTreeSet<usize>, total: usize) -> usize {
    (0..total)
        .find(|index| !completed.contains(index))
        .unwrap_or(total)
}

/// Why a bootstrap run did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous run completed and `force` was not set.
    AlreadyCompleted,
    /// A running state with a fresh heartbeat exists.
    ActiveElsewhere,
    /// Another process holds the lease lock.
    LockHeld,
}

/// What a bootstrap invocation should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    Fresh,
    Resume { completed: BTreeSet<usize> },
    Skip(SkipReason),
}

impl RunDecision {
    /// Returns true unless the run should be skipped.
    #[must_use]
    pub const fn needed(&self) -> bool {
        !matches!(self, Self::Skip(_))
    }

    /// Batches already done when resuming.
    #[must_use]
    pub const fn resume_from_done(&self) -> Option<&BTreeSet<usize>> {
        match self {
            Self::Resume { completed } => Some(completed),
            Self::Fresh | Self::Skip(_) => None,
        }
    }
}

/// Decides whether to run, resume or skip given the stored state.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use kyrograph::bootstrap::{should_run, BootstrapState};
///
/// let mut state = BootstrapState::initial(5);
/// state.updated_at = Utc::now() - Duration::minutes(10);
/// let decision = should_run(Some(&state), false, Utc::now());
/// assert!(decision.needed());
/// ```
#[must_use]
pub fn should_run(state: Option<&BootstrapState>, force: bool, now: DateTime<Utc>) -> RunDecision {
    let Some(state) = state else {
        return RunDecision::Fresh;
    };
    if force {
        return RunDecision::Fresh;
    }

    let resume = || RunDecision::Resume {
        completed: state.completed.clone(),
    };
    match state.status {
        BootstrapStatus::Completed => RunDecision::Skip(SkipReason::AlreadyCompleted),
        BootstrapStatus::Failed | BootstrapStatus::Paused => resume(),
        BootstrapStatus::Running => {
            let stale_after = Duration::seconds(HEARTBEAT_STALE_AFTER_SECS);
            if now.signed_duration_since(state.updated_at) > stale_after {
                resume()
            } else {
                RunDecision::Skip(SkipReason::ActiveElsewhere)
            }
        }
    }
}

/// Sentinel written by older versions when a bootstrap finished.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySentinel {
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    chunks: Option<usize>,
}

/// Loads and saves [`BootstrapState`] for one graph root.
#[derive(Debug, Clone)]
pub struct BootstrapStateStore {
    paths: GraphPaths,
}

impl BootstrapStateStore {
    #[must_use]
    pub fn new(paths: GraphPaths) -> Self {
        Self { paths }
    }

    /// Loads the stored state.
    ///
    /// A corrupt or unknown-version file is logged and treated as absent; an
    /// absent file falls back to migrating the legacy sentinel.
    #[must_use]
    pub fn load(&self) -> Option<BootstrapState> {
        let path = self.paths.bootstrap_state();
        match read_json_or_none::<BootstrapState>(&path) {
            Ok(Some(state)) if state.version <= STATE_SCHEMA_VERSION => return Some(state),
            Ok(Some(state)) => {
                tracing::warn!(
                    path = %path.display(),
                    version = state.version,
                    "bootstrap state written by a newer version; ignoring"
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "bootstrap state corrupt; ignoring");
            }
        }
        self.migrate_legacy()
    }

    /// Persists `state` atomically.
    ///
    /// # Errors
    /// Returns any error from the atomic write.
    pub fn save(&self, state: &BootstrapState) -> Result<(), StorageError> {
        write_json_atomic(&self.paths.bootstrap_state(), state)
    }

    fn migrate_legacy(&self) -> Option<BootstrapState> {
        let sentinel_path = self.paths.legacy_bootstrap_sentinel();
        let text = match read_text_or_none(&sentinel_path) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(path = %sentinel_path.display(), error = %err, "legacy sentinel unreadable");
                return None;
            }
        };

        let trimmed = text.trim();
        let (completed_at, chunks) = match serde_json::from_str::<LegacySentinel>(trimmed) {
            Ok(sentinel) => (sentinel.completed_at, sentinel.chunks),
            Err(_) => (
                DateTime::parse_from_rfc3339(trimmed)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc)),
                None,
            ),
        };
        let completed_at = completed_at.unwrap_or_else(Utc::now);

        let mut state = BootstrapState::initial(0);
        state.status = BootstrapStatus::Completed;
        state.started_at = completed_at;
        state.updated_at = completed_at;
        state.succeeded = chunks.unwrap_or(0);
        tracing::info!(path = %sentinel_path.display(), "migrated legacy bootstrap sentinel");

        if let Err(err) = self.save(&state) {
            tracing::warn!(error = %err, "could not persist migrated bootstrap state");
        }
        Some(state)
    }
}
