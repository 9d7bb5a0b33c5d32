//! Deduplication engine.
//!
//! Cheap local heuristics propose candidate clusters, the external model
//! confirms which are true duplicates, and the merge executor applies the
//! approved plans under the keeper-first data-loss guard.

pub mod audit;
pub mod blocks;
pub mod candidates;
pub mod merge;
pub mod prompts;
pub mod runner;
pub mod similarity;
pub mod state;

pub use audit::{AuditEntry, AuditLog};
pub use blocks::{find_semantic_blocks, topic_domain};
pub use candidates::{find_candidate_clusters, CandidateCluster};
pub use merge::{apply_patch, Conflict, FieldPatch, MergeExecutor, MergeOutcome, MergePlan};
pub use prompts::{DedupPrompter, JsonDedupPrompter};
pub use runner::{DedupMode, DedupReport, DedupRunner};
pub use similarity::{similarity, token_similarity, tokenize, trigram_similarity, trigrams, TextProfile};
pub use state::{DedupState, DedupStateStore};
