//! Filesystem-backed graph store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::node::{KnowledgeNode, NodeId, RegistryEntry};

use super::atomic::write_text_atomic;
use super::document::{parse_node, render_node};
use super::paths::GraphPaths;
use super::traits::GraphStore;

/// Graph store over one directory of node documents.
///
/// The registry is rebuilt from the documents on every call, so it never
/// goes stale relative to direct file edits.
#[derive(Debug, Clone)]
pub struct FsGraphStore {
    paths: GraphPaths,
}

impl FsGraphStore {
    /// Opens the store rooted at `root`, creating the nodes directory.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the nodes directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let paths = GraphPaths::new(root);
        let nodes_dir = paths.nodes_dir();
        fs::create_dir_all(&nodes_dir).map_err(|e| StorageError::io(&nodes_dir, e))?;
        Ok(Self { paths })
    }

    /// Returns the path resolver for this graph.
    #[must_use]
    pub fn paths(&self) -> &GraphPaths {
        &self.paths
    }

    /// Writes a node to its default location and returns that location.
    ///
    /// # Errors
    /// Propagates any error from [`GraphStore::write_node`].
    pub fn insert(&self, node: &KnowledgeNode) -> Result<PathBuf, StorageError> {
        let path = self.node_path(&node.id);
        self.write_node(&path, node)?;
        Ok(path)
    }
}

impl GraphStore for FsGraphStore {
    fn registry(&self) -> Result<Vec<RegistryEntry>, StorageError> {
        let nodes_dir = self.paths.nodes_dir();
        let read_dir = match fs::read_dir(&nodes_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&nodes_dir, err)),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| StorageError::io(&nodes_dir, e))?;
            let path = dir_entry.path();
            if !GraphPaths::is_node_file(&path) {
                continue;
            }
            match self.read_node(&path) {
                Ok(node) => entries.push(node.to_entry(path)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable node");
                }
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    fn read_node(&self, path: &Path) -> Result<KnowledgeNode, StorageError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_path_buf()));
            }
            Err(err) => return Err(StorageError::io(path, err)),
        };
        parse_node(path, &text)
    }

    fn write_node(&self, path: &Path, node: &KnowledgeNode) -> Result<(), StorageError> {
        let text = render_node(node)?;
        write_text_atomic(path, &text)
    }

    fn node_path(&self, id: &NodeId) -> PathBuf {
        self.paths.node_file(id)
    }
}
