//! Path resolution under a graph root.

use std::path::{Path, PathBuf};

use crate::node::NodeId;

const NODES_DIR: &str = "nodes";
const NODE_EXTENSION: &str = "md";
const LOCK_FILE: &str = ".bootstrap.lock";
const BOOTSTRAP_STATE_FILE: &str = ".bootstrap-state.json";
const LEGACY_BOOTSTRAP_SENTINEL: &str = ".bootstrap-complete";
const DEDUP_STATE_FILE: &str = ".dedup-state.json";
const AUDIT_LOG_FILE: &str = ".dedup-audit.jsonl";

/// Resolves every file the maintenance pipelines touch for one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPaths {
    root: PathBuf,
}

impl GraphPaths {
    /// Creates a resolver for the graph at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the graph root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding node documents.
    #[must_use]
    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join(NODES_DIR)
    }

    /// Document path for a node id.
    #[must_use]
    pub fn node_file(&self, id: &NodeId) -> PathBuf {
        self.nodes_dir().join(format!("{id}.{NODE_EXTENSION}"))
    }

    /// Returns true if `path` looks like a node document.
    #[must_use]
    pub fn is_node_file(path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some(NODE_EXTENSION)
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[must_use]
    pub fn bootstrap_state(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_STATE_FILE)
    }

    /// Sentinel written by older versions when a bootstrap finished.
    #[must_use]
    pub fn legacy_bootstrap_sentinel(&self) -> PathBuf {
        self.root.join(LEGACY_BOOTSTRAP_SENTINEL)
    }

    #[must_use]
    pub fn dedup_state(&self) -> PathBuf {
        self.root.join(DEDUP_STATE_FILE)
    }

    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }
}
