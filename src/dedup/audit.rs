//! Append-only merge audit log (one JSON object per line).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::merge::{Conflict, FieldPatch};
use crate::error::StorageError;
use crate::node::NodeId;

/// Provenance of one executed merge. Never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub keeper: NodeId,
    /// Losers actually archived into the keeper.
    pub losers: Vec<NodeId>,
    #[serde(default)]
    pub aliases_added: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub patch: FieldPatch,
}

/// Line-delimited audit file. Single writer; appends are sequential.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entry` as one line.
    ///
    /// # Errors
    /// Returns `StorageError` if the entry cannot be serialized or written.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Reads every well-formed entry; malformed lines are logged and skipped.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the file exists but cannot be read.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&self.path, err)),
        };

        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = number + 1,
                        error = %err,
                        "skipping malformed audit line"
                    );
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(keeper: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            keeper: NodeId::from(keeper),
            losers: vec![NodeId::from("loser")],
            aliases_added: vec!["facts.old".into()],
            conflicts: Vec::new(),
            patch: FieldPatch::default(),
        }
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".dedup-audit.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_is_line_delimited() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".dedup-audit.jsonl"));
        let first = entry("a");
        let second = entry("b");
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"aliasesAdded\""));
        assert_eq!(log.read_all().unwrap(), vec![first, second]);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".dedup-audit.jsonl"));
        let good = entry("a");
        log.append(&good).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{\"timestamp\": broken").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "[1, 2, 3]").unwrap();
        drop(file);
        let later = entry("c");
        log.append(&later).unwrap();

        assert_eq!(log.read_all().unwrap(), vec![good, later]);
    }
}
