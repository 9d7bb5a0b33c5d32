//! Persisted dedup run metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::{read_json_or_none, write_json_atomic, GraphPaths};

/// Dedup progress marker.
///
/// `last_dedup_at` only moves after a fully verified model round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupState {
    #[serde(default)]
    pub last_dedup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs_completed: u64,
    #[serde(default)]
    pub total_merges: u64,
}

impl DedupState {
    /// State after a successful run that executed `merges` merges.
    #[must_use]
    pub fn advance(&self, at: DateTime<Utc>, merges: u64) -> Self {
        Self {
            last_dedup_at: Some(self.last_dedup_at.map_or(at, |previous| previous.max(at))),
            runs_completed: self.runs_completed.saturating_add(1),
            total_merges: self.total_merges.saturating_add(merges),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupStateStore {
    paths: GraphPaths,
}

impl DedupStateStore {
    #[must_use]
    pub fn new(paths: GraphPaths) -> Self {
        Self { paths }
    }

    /// Loads the state; a missing or corrupt file yields the default.
    #[must_use]
    pub fn load(&self) -> DedupState {
        let path = self.paths.dedup_state();
        match read_json_or_none(&path) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "dedup state corrupt; starting over");
                DedupState::default()
            }
        }
    }

    /// # Errors
    /// Returns any error from the atomic write.
    pub fn save(&self, state: &DedupState) -> Result<(), StorageError> {
        write_json_atomic(&self.paths.dedup_state(), state)
    }
}
