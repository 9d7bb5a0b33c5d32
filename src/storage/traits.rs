//! Abstract storage trait for KyroGraph.
//!
//! The pipelines never assume a particular backend: the filesystem store
//! is the production implementation, tests may substitute their own.

use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::node::{KnowledgeNode, NodeId, RegistryEntry};

/// Storage contract consumed by the bootstrap and dedup pipelines.
///
/// # Safety Considerations
/// - `write_node` must be atomic: readers never observe a partial document
/// - `registry` reflects writes that completed before it was called
pub trait GraphStore: Send + Sync {
    /// Metadata for every node in the graph, archived ones included.
    fn registry(&self) -> Result<Vec<RegistryEntry>, StorageError>;

    /// Reads and parses the node document at `path`.
    fn read_node(&self, path: &Path) -> Result<KnowledgeNode, StorageError>;

    /// Writes `node` to `path`, replacing any existing document.
    fn write_node(&self, path: &Path, node: &KnowledgeNode) -> Result<(), StorageError>;

    /// Location a new node with `id` should be written to.
    fn node_path(&self, id: &NodeId) -> PathBuf;
}
