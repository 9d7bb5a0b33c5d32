//! # KyroGraph - Maintenance Pipelines for a File-Backed Knowledge Graph
//!
//! KyroGraph keeps a graph of small text records ("nodes") consistent and
//! non-redundant while an unreliable external model does most of the work.
//!
//! ## Core Concepts
//!
//! - **Bootstrap**: crash-resumable, single-instance batch ingestion of
//!   source material into nodes
//! - **Lease Lock**: heartbeat-renewed, token-guarded lock file giving one
//!   process exclusive use of a graph root
//! - **Rate-Limit Breaker**: shared backoff gate for concurrent model calls
//! - **Dedup**: heuristic clustering, model confirmation and guarded merges
//!   with an append-only audit trail
//!
//! Both pipelines are fail-closed: durable progress markers only move once
//! the corresponding work is verified complete.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyrograph::{BootstrapRunner, DedupMode, DedupRunner, FsGraphStore, MaintenanceConfig};
//!
//! let config = MaintenanceConfig::from_json_file("kyrograph.json".as_ref())?;
//! let store = Arc::new(FsGraphStore::open("/var/lib/graph")?);
//! let paths = store.paths().clone();
//!
//! let dedup = Arc::new(DedupRunner::new(paths.clone(), store.clone(), model.clone(), config.dedup));
//! let bootstrap = BootstrapRunner::new(paths, store, model, config.bootstrap)
//!     .with_maintenance(dedup.clone());
//!
//! let report = bootstrap.run(&chunks, false).await;
//! let dedup_report = dedup.run(DedupMode::Incremental).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

// Shared foundations
pub mod config;
pub mod error;
pub mod lease;
pub mod model;
pub mod node;
pub mod storage;
pub mod telemetry;

// Pipelines
pub mod bootstrap;
pub mod dedup;

pub use bootstrap::{
    BootstrapReport, BootstrapRunner, BootstrapState, BootstrapStatus, MaintenanceHook,
    SkipReason, SourceChunk,
};
pub use config::{BootstrapConfig, DedupConfig, MaintenanceConfig};
pub use dedup::{DedupMode, DedupReport, DedupRunner, MergePlan};
pub use error::{
    BreakerAborted, ConfigError, KyroGraphError, KyroGraphResult, MergeError, ModelError,
    ModelErrorKind, ResponseError, StorageError,
};
pub use lease::{LeaseLock, LockRecord};
pub use model::{ExternalModel, Generation};
pub use node::{KnowledgeNode, NodeDraft, NodeId, NodeType, Priority, RegistryEntry};
pub use storage::{FsGraphStore, GraphPaths, GraphStore};
pub use telemetry::init_tracing;
