//! Bootstrap orchestrator.
//!
//! Drives packed batches of source text through the external model with a
//! pool of tokio workers. The run is process-exclusive through the lease
//! lock, resumable through the persisted state, and gated by a single
//! rate-limit breaker shared by every worker.
//!
//! Progress is fail-closed: a batch interrupted by an abort is never
//! recorded, so the next run picks it up again.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::bootstrap::batcher::{max_output_tokens, pack, SourceChunk};
use crate::bootstrap::breaker::RateLimitBreaker;
use crate::bootstrap::persist::DebouncedStateWriter;
use crate::bootstrap::prompts::{BootstrapPrompter, JsonBootstrapPrompter};
use crate::bootstrap::state::{
    should_run, BatchResult, BootstrapState, BootstrapStateStore, BootstrapStatus, RunDecision,
    SkipReason,
};
use crate::config::BootstrapConfig;
use crate::error::{KyroGraphError, ModelErrorKind, StorageError};
use crate::lease::LeaseLock;
use crate::model::{call_with_timeout, ExternalModel, Generation};
use crate::node::{KnowledgeNode, NodeDraft, NodeId, Priority, RegistryEntry};
use crate::storage::{GraphPaths, GraphStore};

/// Post-bootstrap maintenance, run once after the first completed bootstrap.
#[async_trait]
pub trait MaintenanceHook: Send + Sync {
    /// # Errors
    /// Any error leaves the maintenance flag unset so a later run retries.
    async fn run_maintenance(&self) -> Result<(), KyroGraphError>;
}

/// Outcome of one [`BootstrapRunner::run`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Set when the run did not start.
    pub skipped: Option<SkipReason>,
    /// Persisted status at the end of the call.
    pub status: Option<BootstrapStatus>,
    pub batches_processed: usize,
    pub chunks_succeeded: usize,
    pub chunks_failed: usize,
    pub nodes_written: usize,
    pub more_work_remaining: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: Vec<String>,
}

impl BootstrapReport {
    fn skipped(reason: SkipReason, status: Option<BootstrapStatus>) -> Self {
        Self {
            skipped: Some(reason),
            status,
            ..Self::default()
        }
    }
}

/// Counters accumulated by the workers of one run.
#[derive(Debug, Default)]
struct Tally {
    batches_processed: usize,
    chunks_succeeded: usize,
    chunks_failed: usize,
    nodes_written: usize,
    input_tokens: u64,
    output_tokens: u64,
    errors: Vec<String>,
    abort_reason: Option<String>,
}

/// How a batch left the worker.
enum BatchFate {
    Recorded,
    Aborted,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the workers of one run.
struct RunContext {
    batches: Vec<Vec<SourceChunk>>,
    queue: Mutex<VecDeque<usize>>,
    state: Mutex<BootstrapState>,
    writer: DebouncedStateWriter,
    breaker: RateLimitBreaker,
    /// FIFO critical section around registry reads and node writes.
    upsert: tokio::sync::Mutex<()>,
    tally: Mutex<Tally>,
    store: Arc<dyn GraphStore>,
    model: Arc<dyn ExternalModel>,
    prompter: Arc<dyn BootstrapPrompter>,
    config: BootstrapConfig,
}

impl RunContext {
    fn next_batch(&self) -> Option<usize> {
        guard(&self.queue).pop_front()
    }

    async fn work(self: Arc<Self>) {
        while !self.breaker.is_aborted() {
            let Some(index) = self.next_batch() else {
                break;
            };
            if let BatchFate::Aborted = self.process_batch(index).await {
                break;
            }
        }
    }

    async fn process_batch(&self, index: usize) -> BatchFate {
        let batch = &self.batches[index];
        let prompt = self.prompter.build(batch);
        let max_tokens = max_output_tokens(batch.len());

        let generation = loop {
            if self.breaker.await_gate().await.is_err() {
                return BatchFate::Aborted;
            }
            let result = call_with_timeout(
                self.model.as_ref(),
                &prompt.system,
                &prompt.user,
                max_tokens,
                self.config.call_timeout(),
            )
            .await;

            match result {
                Ok(generation) => {
                    self.breaker.on_success();
                    break generation;
                }
                Err(err) => match err.kind() {
                    ModelErrorKind::RateLimited => {
                        if !self.breaker.start_backoff() {
                            self.note_abort(format!("batch {index}: {err}"));
                            return BatchFate::Aborted;
                        }
                    }
                    ModelErrorKind::Unreachable => {
                        self.note_abort(format!("batch {index}: {err}"));
                        self.breaker.abort();
                        return BatchFate::Aborted;
                    }
                    ModelErrorKind::Other => {
                        return self.record(index, BatchResult::failure(batch.len(), err.to_string()));
                    }
                },
            }
        };
        self.count_tokens(&generation);

        let drafts = match self.prompter.parse(&generation.text) {
            Ok(drafts) => drafts,
            Err(err) => {
                return self.record(index, BatchResult::failure(batch.len(), err.to_string()));
            }
        };

        let written = {
            let _turn = self.upsert.lock().await;
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || upsert_drafts(store.as_ref(), drafts)).await
        };
        match written {
            Ok(Ok(count)) => {
                guard(&self.tally).nodes_written += count;
                self.record(index, BatchResult::success(batch.len()))
            }
            Ok(Err(err)) => self.record(index, BatchResult::failure(batch.len(), err.to_string())),
            Err(err) => self.record(
                index,
                BatchResult::failure(batch.len(), format!("node upsert task failed: {err}")),
            ),
        }
    }

    fn record(&self, index: usize, result: BatchResult) -> BatchFate {
        {
            let mut state = guard(&self.state);
            let next = state.advance_batch(index, &result);
            self.writer.push(next.clone());
            *state = next;
        }

        let mut tally = guard(&self.tally);
        tally.batches_processed += 1;
        if result.succeeded {
            tally.chunks_succeeded += result.chunk_count;
            tracing::debug!(batch = index, chunks = result.chunk_count, "batch completed");
        } else {
            tally.chunks_failed += result.chunk_count;
            let error = result.error.unwrap_or_default();
            tracing::warn!(batch = index, error = %error, "batch failed");
            tally.errors.push(format!("batch {index}: {error}"));
        }
        BatchFate::Recorded
    }

    fn count_tokens(&self, generation: &Generation) {
        let mut tally = guard(&self.tally);
        tally.input_tokens = tally.input_tokens.saturating_add(generation.input_tokens);
        tally.output_tokens = tally.output_tokens.saturating_add(generation.output_tokens);
    }

    fn note_abort(&self, reason: String) {
        let mut tally = guard(&self.tally);
        tally.abort_reason.get_or_insert_with(|| reason.clone());
        tally.errors.push(reason);
    }

    fn heartbeat(&self) {
        let mut state = guard(&self.state);
        let next = state.heartbeat();
        self.writer.push(next.clone());
        *state = next;
    }
}

/// Applies model drafts to the graph and returns how many nodes were written.
///
/// A draft whose canonical key matches a live node's key or alias updates
/// that node; anything else becomes a new node. Links are resolved against
/// keys, aliases and ids, and unresolvable links are dropped.
fn upsert_drafts(store: &dyn GraphStore, drafts: Vec<NodeDraft>) -> Result<usize, StorageError> {
    let mut registry: Vec<RegistryEntry> = store
        .registry()?
        .into_iter()
        .filter(|entry| !entry.archived)
        .collect();

    let mut written = 0;
    for draft in drafts {
        let links = resolve_links(&registry, &draft.links);
        let existing = registry
            .iter()
            .position(|entry| entry.answers_to(&draft.canonical_key));

        let (path, node) = match existing {
            Some(position) => {
                let path = registry[position].path.clone();
                let mut node = store.read_node(&path)?;
                apply_draft(&mut node, draft, links);
                (path, node)
            }
            None => {
                let mut node = KnowledgeNode::new(draft.node_type, draft.canonical_key, draft.description);
                node.tags = dedup_strings(draft.tags);
                node.links = links;
                node.body = draft.body;
                node.priority = draft.priority;
                (store.node_path(&node.id), node)
            }
        };

        store.write_node(&path, &node)?;
        let entry = node.to_entry(path);
        match existing {
            Some(position) => registry[position] = entry,
            None => registry.push(entry),
        }
        written += 1;
    }
    Ok(written)
}

fn apply_draft(node: &mut KnowledgeNode, draft: NodeDraft, links: Vec<NodeId>) {
    if !draft.description.trim().is_empty() {
        node.description = draft.description;
    }
    for tag in draft.tags {
        if !node.tags.contains(&tag) {
            node.tags.push(tag);
        }
    }
    for link in links {
        if link != node.id && !node.links.contains(&link) {
            node.links.push(link);
        }
    }
    let body = draft.body.trim();
    if !body.is_empty() && !node.body.contains(body) {
        if !node.body.is_empty() {
            node.body.push_str("\n\n");
        }
        node.body.push_str(body);
    }
    if draft.priority != Priority::default() {
        node.priority = draft.priority;
    }
    node.touch();
}

fn resolve_links(registry: &[RegistryEntry], raw: &[String]) -> Vec<NodeId> {
    let mut resolved: Vec<NodeId> = Vec::new();
    for link in raw {
        let target = registry
            .iter()
            .find(|entry| entry.answers_to(link) || entry.id.as_str() == link);
        match target {
            Some(entry) if !resolved.contains(&entry.id) => resolved.push(entry.id.clone()),
            Some(_) => {}
            None => tracing::debug!(link = %link, "dropping unresolved link"),
        }
    }
    resolved
}

fn dedup_strings(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

/// Crash-resumable, single-instance bootstrap pipeline for one graph root.
pub struct BootstrapRunner {
    paths: GraphPaths,
    store: Arc<dyn GraphStore>,
    model: Arc<dyn ExternalModel>,
    prompter: Arc<dyn BootstrapPrompter>,
    lease: Arc<LeaseLock>,
    maintenance: Option<Arc<dyn MaintenanceHook>>,
    config: BootstrapConfig,
}

impl BootstrapRunner {
    /// Creates a runner with the default JSON prompter and a private lease manager.
    #[must_use]
    pub fn new(
        paths: GraphPaths,
        store: Arc<dyn GraphStore>,
        model: Arc<dyn ExternalModel>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            paths,
            store,
            model,
            prompter: Arc::new(JsonBootstrapPrompter),
            lease: Arc::new(LeaseLock::new()),
            maintenance: None,
            config,
        }
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn BootstrapPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Shares a lease manager, e.g. with other pipelines of the same host.
    #[must_use]
    pub fn with_lease(mut self, lease: Arc<LeaseLock>) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_maintenance(mut self, hook: Arc<dyn MaintenanceHook>) -> Self {
        self.maintenance = Some(hook);
        self
    }

    /// Runs, resumes or skips the bootstrap over `chunks`.
    ///
    /// Never fails: every problem ends up in the report's error list.
    pub async fn run(&self, chunks: &[SourceChunk], force: bool) -> BootstrapReport {
        let root = self.paths.root().to_path_buf();
        if !self.lease.acquire(&root) {
            tracing::info!(root = %root.display(), "bootstrap already running elsewhere");
            return BootstrapReport::skipped(SkipReason::LockHeld, None);
        }

        let report = self.run_locked(root.clone(), chunks, force).await;
        self.lease.release(&root);
        tracing::info!(
            status = ?report.status,
            skipped = ?report.skipped,
            batches = report.batches_processed,
            nodes = report.nodes_written,
            errors = report.errors.len(),
            "bootstrap run finished"
        );
        report
    }

    async fn run_locked(&self, root: PathBuf, chunks: &[SourceChunk], force: bool) -> BootstrapReport {
        let state_store = BootstrapStateStore::new(self.paths.clone());
        let stored = state_store.load();
        let decision = should_run(stored.as_ref(), force, Utc::now());

        if let RunDecision::Skip(reason) = decision {
            let mut report = BootstrapReport::skipped(reason, stored.as_ref().map(|s| s.status));
            if let (SkipReason::AlreadyCompleted, Some(state)) = (reason, stored) {
                // Covers a crash between finalize and the maintenance hook.
                let before = state.maintenance_completed;
                let state = self.maybe_run_maintenance(state, &mut report.errors).await;
                if state.maintenance_completed != before {
                    if let Err(err) = state_store.save(&state) {
                        report.errors.push(format!("state write failed: {err}"));
                    }
                }
            }
            return report;
        }

        let batches = pack(chunks, self.config.char_budget);
        let initial = match (decision, stored) {
            (RunDecision::Resume { .. }, Some(state)) if state.total == batches.len() => {
                tracing::info!(cursor = state.cursor, total = state.total, "resuming bootstrap");
                state.resume()
            }
            (RunDecision::Resume { .. }, Some(state)) => {
                tracing::info!(
                    stored_total = state.total,
                    total = batches.len(),
                    "source changed since last run; starting fresh"
                );
                BootstrapState::initial(batches.len())
            }
            _ => BootstrapState::initial(batches.len()),
        };
        if let Err(err) = state_store.save(&initial) {
            tracing::warn!(error = %err, "initial bootstrap state write failed");
        }

        let remaining = initial.remaining();
        let budget = self.config.max_batches_per_run.unwrap_or(usize::MAX);
        let scheduled: VecDeque<usize> = remaining.iter().copied().take(budget).collect();
        let budget_exhausted = scheduled.len() < remaining.len();
        let workers = self.config.concurrency.max(1).min(scheduled.len());

        let ctx = Arc::new(RunContext {
            batches,
            queue: Mutex::new(scheduled),
            state: Mutex::new(initial),
            writer: DebouncedStateWriter::new(state_store, self.config.persist_debounce()),
            breaker: RateLimitBreaker::new(),
            upsert: tokio::sync::Mutex::new(()),
            tally: Mutex::new(Tally::default()),
            store: Arc::clone(&self.store),
            model: Arc::clone(&self.model),
            prompter: Arc::clone(&self.prompter),
            config: self.config.clone(),
        });

        let shutdown = Arc::new(Notify::new());
        let heartbeat = {
            let ctx = Arc::clone(&ctx);
            let lease = Arc::clone(&self.lease);
            let shutdown = Arc::clone(&shutdown);
            let period = self.config.heartbeat_interval().max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            lease.refresh(&root);
                            ctx.heartbeat();
                        }
                    }
                }
            })
        };

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(Arc::clone(&ctx).work());
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "bootstrap worker panicked");
                guard(&ctx.tally).errors.push(format!("worker failed: {err}"));
            }
        }
        // The heartbeat must be fully stopped before the final state write
        // and the lease release, or it can resurrect either.
        shutdown.notify_one();
        if let Err(err) = heartbeat.await {
            tracing::warn!(error = %err, "bootstrap heartbeat task failed");
        }

        let aborted = ctx.breaker.is_aborted();
        let current = guard(&ctx.state).clone();
        let mut tally = std::mem::take(&mut *guard(&ctx.tally));

        let mut last = if aborted {
            let reason = tally
                .abort_reason
                .take()
                .unwrap_or_else(|| "model calls aborted".to_string());
            current.fail(reason)
        } else if budget_exhausted {
            current.pause()
        } else {
            current.finalize()
        };
        if last.status == BootstrapStatus::Completed {
            last = self.maybe_run_maintenance(last, &mut tally.errors).await;
        }

        ctx.writer.push(last.clone());
        if let Err(err) = ctx.writer.flush_now() {
            tracing::error!(error = %err, "final bootstrap state write failed");
            tally.errors.push(format!("state write failed: {err}"));
        }

        BootstrapReport {
            skipped: None,
            status: Some(last.status),
            batches_processed: tally.batches_processed,
            chunks_succeeded: tally.chunks_succeeded,
            chunks_failed: tally.chunks_failed,
            nodes_written: tally.nodes_written,
            more_work_remaining: aborted || budget_exhausted,
            input_tokens: tally.input_tokens,
            output_tokens: tally.output_tokens,
            errors: tally.errors,
        }
    }

    async fn maybe_run_maintenance(
        &self,
        state: BootstrapState,
        errors: &mut Vec<String>,
    ) -> BootstrapState {
        if state.maintenance_completed || !self.config.run_maintenance {
            return state;
        }
        let Some(hook) = &self.maintenance else {
            return state;
        };

        match hook.run_maintenance().await {
            Ok(()) => {
                tracing::info!("post-bootstrap maintenance completed");
                state.with_maintenance_completed()
            }
            Err(err) => {
                tracing::warn!(error = %err, "post-bootstrap maintenance failed");
                errors.push(format!("maintenance failed: {err}"));
                state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsGraphStore;
    use crate::node::NodeType;
    use tempfile::tempdir;

    fn draft(key: &str, description: &str) -> NodeDraft {
        NodeDraft {
            node_type: NodeType::Preference,
            canonical_key: key.to_string(),
            description: description.to_string(),
            tags: Vec::new(),
            links: Vec::new(),
            body: String::new(),
            priority: Priority::Normal,
        }
    }

    #[test]
    fn test_upsert_creates_then_updates_by_key() {
        let dir = tempdir().unwrap();
        let store = FsGraphStore::open(dir.path()).unwrap();

        let mut first = draft("preferences.editor", "uses vim");
        first.tags = vec!["tools".into(), "tools".into()];
        assert_eq!(upsert_drafts(&store, vec![first]).unwrap(), 1);

        let mut second = draft("preferences.editor", "uses helix");
        second.tags = vec!["editor".into()];
        second.body = "Switched in 2025.".into();
        assert_eq!(upsert_drafts(&store, vec![second]).unwrap(), 1);

        let registry = store.registry().unwrap();
        assert_eq!(registry.len(), 1);
        let node = store.read_node(&registry[0].path).unwrap();
        assert_eq!(node.description, "uses helix");
        assert_eq!(node.tags, vec!["tools".to_string(), "editor".to_string()]);
        assert_eq!(node.body, "Switched in 2025.");
    }

    #[test]
    fn test_upsert_matches_alias_and_skips_archived() {
        let dir = tempdir().unwrap();
        let store = FsGraphStore::open(dir.path()).unwrap();

        let mut keeper = KnowledgeNode::new(NodeType::Preference, "preferences.theme", "dark");
        keeper.aliases.push("preferences.dark_mode".into());
        store.insert(&keeper).unwrap();
        let mut archived = KnowledgeNode::new(NodeType::Preference, "preferences.font", "mono");
        archived.archive_into(&keeper.id);
        store.insert(&archived).unwrap();

        upsert_drafts(
            &store,
            vec![
                draft("preferences.dark_mode", "dark everywhere"),
                draft("preferences.font", "serif"),
            ],
        )
        .unwrap();

        let registry = store.registry().unwrap();
        assert_eq!(registry.len(), 3);
        let updated = registry.iter().find(|e| e.id == keeper.id).unwrap();
        assert_eq!(updated.description, "dark everywhere");
        let fonts: Vec<_> = registry
            .iter()
            .filter(|e| e.canonical_key == "preferences.font")
            .collect();
        assert_eq!(fonts.len(), 2);
        assert!(fonts.iter().any(|e| !e.archived && e.description == "serif"));
    }

    #[test]
    fn test_upsert_resolves_links_within_batch() {
        let dir = tempdir().unwrap();
        let store = FsGraphStore::open(dir.path()).unwrap();

        let project = draft("projects.kyrograph", "graph engine");
        let mut decision = draft("decisions.storage", "files over a database");
        decision.links = vec!["projects.kyrograph".into(), "unknown.key".into()];
        upsert_drafts(&store, vec![project, decision]).unwrap();

        let registry = store.registry().unwrap();
        let project = registry
            .iter()
            .find(|e| e.canonical_key == "projects.kyrograph")
            .unwrap();
        let decision = registry
            .iter()
            .find(|e| e.canonical_key == "decisions.storage")
            .unwrap();
        assert_eq!(decision.links, vec![project.id.clone()]);
    }
}
