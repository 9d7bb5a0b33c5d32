//! Bootstrap pipeline: batch ingestion of source material into graph nodes.
//!
//! The pipeline is split into leaf components that are pure or nearly so
//! (batcher, breaker, state machine) and the orchestrator that wires them
//! to the lease lock, the graph store and the external model.

pub mod batcher;
pub mod breaker;
pub mod persist;
pub mod prompts;
pub mod runner;
pub mod state;

pub use batcher::{chunk_text, max_output_tokens, pack, SourceChunk};
pub use breaker::{compute_backoff, RateLimitBreaker, ABORT_THRESHOLD, BACKOFF_SCHEDULE_SECS};
pub use persist::DebouncedStateWriter;
pub use prompts::{BootstrapPrompter, JsonBootstrapPrompter, Prompt};
pub use runner::{BootstrapReport, BootstrapRunner, MaintenanceHook};
pub use state::{
    should_run, BatchResult, BootstrapState, BootstrapStateStore, BootstrapStatus, RunDecision,
    SkipReason, HEARTBEAT_STALE_AFTER_SECS, STATE_SCHEMA_VERSION,
};
