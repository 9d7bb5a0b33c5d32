//! Storage collaborator for KyroGraph.
//!
//! The maintenance pipelines only need a narrow slice of the node store:
//! bulk metadata scans, single-file reads and writes, atomic JSON state files
//! and path resolution under a graph root.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── nodes/<id>.md            node documents (JSON frontmatter + body)
//! ├── .bootstrap.lock          lease lock record
//! ├── .bootstrap-state.json    bootstrap progress
//! ├── .bootstrap-complete      legacy completion sentinel (read-only)
//! ├── .dedup-state.json        dedup run metadata
//! └── .dedup-audit.jsonl       append-only merge provenance
//! ```

mod atomic;
mod document;
mod fs;
mod paths;
mod traits;

pub use atomic::{read_json_or_none, read_text_or_none, write_json_atomic, write_text_atomic};
pub use document::{parse_node, render_node};
pub use fs::FsGraphStore;
pub use paths::GraphPaths;
pub use traits::GraphStore;
