//! End-to-end bootstrap runs against a scripted model.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kyrograph::bootstrap::{
    BatchResult, BootstrapRunner, BootstrapState, BootstrapStateStore, BootstrapStatus,
    MaintenanceHook, SkipReason, SourceChunk,
};
use kyrograph::config::BootstrapConfig;
use kyrograph::lease::LeaseLock;
use kyrograph::model::{ExternalModel, Generation};
use kyrograph::storage::{FsGraphStore, GraphPaths, GraphStore};
use kyrograph::{KyroGraphError, ModelError};
use tempfile::{tempdir, TempDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Nodes,
    RateLimited,
    Unreachable,
    Garbage,
    Fail,
}

/// Answers per source name; unscripted sources get valid nodes.
#[derive(Default)]
struct ScriptedModel {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    always: Mutex<Option<Reply>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, source: &str, replies: &[Reply]) {
        self.script
            .lock()
            .unwrap()
            .insert(source.to_string(), replies.iter().copied().collect());
    }

    fn always(&self, reply: Reply) {
        *self.always.lock().unwrap() = Some(reply);
    }

    fn called_sources(&self) -> BTreeSet<String> {
        self.calls.lock().unwrap().iter().flatten().cloned().collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn sources_in(prompt: &str) -> Vec<String> {
    prompt
        .split("name=\"")
        .skip(1)
        .filter_map(|rest| rest.split('"').next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ExternalModel for ScriptedModel {
    async fn generate(&self, _system: &str, user: &str, _max: u32) -> Result<Generation, ModelError> {
        let sources = sources_in(user);
        self.calls.lock().unwrap().push(sources.clone());

        let scripted = {
            let mut script = self.script.lock().unwrap();
            sources
                .iter()
                .find_map(|source| script.get_mut(source).and_then(VecDeque::pop_front))
        };
        let reply = self.always.lock().unwrap().or(scripted).unwrap_or(Reply::Nodes);

        match reply {
            Reply::Nodes => {
                let nodes: Vec<_> = sources
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "type": "fact",
                            "canonicalKey": format!("facts.{s}"),
                            "description": format!("fact learned from {s}"),
                        })
                    })
                    .collect();
                Ok(Generation {
                    text: serde_json::json!({ "nodes": nodes }).to_string(),
                    input_tokens: 10,
                    output_tokens: 5,
                })
            }
            Reply::RateLimited => Err(ModelError::rate_limited("429")),
            Reply::Unreachable => Err(ModelError::unreachable("connection refused")),
            Reply::Garbage => Ok(Generation {
                text: "I could not find anything useful.".to_string(),
                input_tokens: 10,
                output_tokens: 3,
            }),
            Reply::Fail => Err(ModelError::other("400 bad request")),
        }
    }
}

/// Delays every answer so heartbeats interleave with batches.
struct SlowModel(Arc<ScriptedModel>);

#[async_trait]
impl ExternalModel for SlowModel {
    async fn generate(&self, system: &str, user: &str, max: u32) -> Result<Generation, ModelError> {
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        self.0.generate(system, user, max).await
    }
}

struct Graph {
    _dir: TempDir,
    paths: GraphPaths,
    store: Arc<FsGraphStore>,
}

fn graph() -> Graph {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsGraphStore::open(dir.path()).unwrap());
    Graph {
        paths: store.paths().clone(),
        store,
        _dir: dir,
    }
}

fn chunks(count: usize) -> Vec<SourceChunk> {
    (0..count)
        .map(|i| SourceChunk::new(format!("s{i}"), format!("conversation number {i}")))
        .collect()
}

/// One chunk per batch so batch indices equal chunk indices.
fn config() -> BootstrapConfig {
    BootstrapConfig {
        char_budget: 0,
        concurrency: 1,
        ..BootstrapConfig::default()
    }
}

fn runner(graph: &Graph, model: &Arc<ScriptedModel>, config: BootstrapConfig) -> BootstrapRunner {
    BootstrapRunner::new(graph.paths.clone(), graph.store.clone(), model.clone(), config)
}

fn load(graph: &Graph) -> BootstrapState {
    BootstrapStateStore::new(graph.paths.clone()).load().unwrap()
}

fn set(indices: &[usize]) -> BTreeSet<usize> {
    indices.iter().copied().collect()
}

#[tokio::test]
async fn test_fresh_run_completes_and_skips_next_time() {
    let graph = graph();
    let model = ScriptedModel::new();
    let runner = runner(&graph, &model, BootstrapConfig { concurrency: 3, ..config() });

    let report = runner.run(&chunks(4), false).await;
    assert_eq!(report.skipped, None);
    assert_eq!(report.status, Some(BootstrapStatus::Completed));
    assert_eq!(report.batches_processed, 4);
    assert_eq!(report.chunks_succeeded, 4);
    assert_eq!(report.nodes_written, 4);
    assert!(!report.more_work_remaining);
    assert_eq!(report.input_tokens, 40);
    assert!(report.errors.is_empty());

    let state = load(&graph);
    assert_eq!(state.status, BootstrapStatus::Completed);
    assert!(state.completed.is_empty());
    assert_eq!(state.cursor, 4);
    assert_eq!(graph.store.registry().unwrap().len(), 4);
    assert!(!graph.paths.lock_file().exists());

    let again = runner.run(&chunks(4), false).await;
    assert_eq!(again.skipped, Some(SkipReason::AlreadyCompleted));
    assert_eq!(model.call_count(), 4);
}

#[tokio::test]
async fn test_forced_rerun_updates_existing_nodes() {
    let graph = graph();
    let model = ScriptedModel::new();
    let runner = runner(&graph, &model, config());

    runner.run(&chunks(2), false).await;
    let forced = runner.run(&chunks(2), true).await;
    assert_eq!(forced.status, Some(BootstrapStatus::Completed));
    assert_eq!(forced.nodes_written, 2);
    assert_eq!(graph.store.registry().unwrap().len(), 2);
}

#[tokio::test]
async fn test_resume_after_crash_skips_completed_batches() {
    let graph = graph();
    let mut crashed = BootstrapState::initial(5)
        .advance_batch(0, &BatchResult::success(1))
        .advance_batch(2, &BatchResult::success(1));
    crashed.updated_at = Utc::now() - Duration::minutes(10);
    BootstrapStateStore::new(graph.paths.clone()).save(&crashed).unwrap();

    let model = ScriptedModel::new();
    let report = runner(&graph, &model, config()).run(&chunks(5), false).await;

    assert_eq!(report.status, Some(BootstrapStatus::Completed));
    assert_eq!(report.batches_processed, 3);
    let expected: BTreeSet<String> = ["s1", "s3", "s4"].iter().map(|s| s.to_string()).collect();
    assert_eq!(model.called_sources(), expected);
    assert_eq!(load(&graph).succeeded, 5);
}

#[tokio::test]
async fn test_changed_source_starts_fresh() {
    let graph = graph();
    let paused = BootstrapState::initial(3)
        .advance_batch(0, &BatchResult::success(1))
        .pause();
    BootstrapStateStore::new(graph.paths.clone()).save(&paused).unwrap();

    let model = ScriptedModel::new();
    let report = runner(&graph, &model, config()).run(&chunks(4), false).await;
    assert_eq!(report.batches_processed, 4);
    assert_eq!(model.called_sources().len(), 4);
}

#[tokio::test]
async fn test_active_run_elsewhere_is_not_disturbed() {
    let graph = graph();
    let active = BootstrapState::initial(3).advance_batch(0, &BatchResult::success(1));
    BootstrapStateStore::new(graph.paths.clone()).save(&active).unwrap();

    let model = ScriptedModel::new();
    let report = runner(&graph, &model, config()).run(&chunks(3), false).await;
    assert_eq!(report.skipped, Some(SkipReason::ActiveElsewhere));
    assert_eq!(model.call_count(), 0);
    assert_eq!(load(&graph), active);
}

#[tokio::test]
async fn test_lock_held_by_another_manager() {
    let graph = graph();
    let other = LeaseLock::new();
    assert!(other.acquire(graph.paths.root()));

    let model = ScriptedModel::new();
    let report = runner(&graph, &model, config()).run(&chunks(2), false).await;
    assert_eq!(report.skipped, Some(SkipReason::LockHeld));
    assert_eq!(model.call_count(), 0);
    assert!(graph.paths.lock_file().exists());
    other.release(graph.paths.root());
}

#[tokio::test]
async fn test_budget_pauses_then_resumes() {
    let graph = graph();
    let model = ScriptedModel::new();
    let limited = BootstrapConfig {
        max_batches_per_run: Some(2),
        ..config()
    };

    let first = runner(&graph, &model, limited.clone()).run(&chunks(5), false).await;
    assert_eq!(first.status, Some(BootstrapStatus::Paused));
    assert!(first.more_work_remaining);
    assert_eq!(first.batches_processed, 2);
    let state = load(&graph);
    assert_eq!(state.completed, set(&[0, 1]));
    assert_eq!(state.cursor, 2);
    assert!(!graph.paths.lock_file().exists());

    let second = runner(&graph, &model, limited.clone()).run(&chunks(5), false).await;
    assert_eq!(second.status, Some(BootstrapStatus::Paused));
    assert_eq!(load(&graph).completed, set(&[0, 1, 2, 3]));

    let third = runner(&graph, &model, limited).run(&chunks(5), false).await;
    assert_eq!(third.status, Some(BootstrapStatus::Completed));
    assert!(!third.more_work_remaining);
    assert_eq!(model.call_count(), 5);
}

#[tokio::test]
async fn test_unreachable_aborts_and_keeps_completed_set() {
    let graph = graph();
    let model = ScriptedModel::new();
    model.script("s2", &[Reply::Unreachable]);

    let report = runner(&graph, &model, config()).run(&chunks(4), false).await;
    assert_eq!(report.status, Some(BootstrapStatus::Failed));
    assert!(report.more_work_remaining);
    assert_eq!(report.batches_processed, 2);
    assert!(report.errors.iter().any(|e| e.contains("unreachable")));

    let state = load(&graph);
    assert_eq!(state.status, BootstrapStatus::Failed);
    assert_eq!(state.completed, set(&[0, 1]));
    assert!(!graph.paths.lock_file().exists());

    let resumed = runner(&graph, &model, config()).run(&chunks(4), false).await;
    assert_eq!(resumed.status, Some(BootstrapStatus::Completed));
    assert_eq!(resumed.batches_processed, 2);
    assert_eq!(graph.store.registry().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_rate_limit_aborts() {
    let graph = graph();
    let model = ScriptedModel::new();
    model.always(Reply::RateLimited);

    let report = runner(&graph, &model, config()).run(&chunks(3), false).await;
    assert_eq!(report.status, Some(BootstrapStatus::Failed));
    assert_eq!(report.batches_processed, 0);
    assert_eq!(model.call_count(), 5);
    assert!(load(&graph).completed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_rate_limit_recovers() {
    let graph = graph();
    let model = ScriptedModel::new();
    model.script("s1", &[Reply::RateLimited, Reply::RateLimited]);

    let report = runner(&graph, &model, config()).run(&chunks(3), false).await;
    assert_eq!(report.status, Some(BootstrapStatus::Completed));
    assert_eq!(report.chunks_succeeded, 3);
    assert_eq!(model.call_count(), 5);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_bad_batches_are_recorded_as_failed() {
    let graph = graph();
    let model = ScriptedModel::new();
    model.script("s0", &[Reply::Garbage]);
    model.script("s2", &[Reply::Fail]);

    let report = runner(&graph, &model, config()).run(&chunks(3), false).await;
    assert_eq!(report.status, Some(BootstrapStatus::Completed));
    assert_eq!(report.chunks_succeeded, 1);
    assert_eq!(report.chunks_failed, 2);
    assert_eq!(report.errors.len(), 2);

    let state = load(&graph);
    assert_eq!(state.failed, 2);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn test_all_batches_failing_finalizes_failed() {
    let graph = graph();
    let model = ScriptedModel::new();
    model.always(Reply::Garbage);

    let report = runner(&graph, &model, config()).run(&chunks(2), false).await;
    assert_eq!(report.status, Some(BootstrapStatus::Failed));
    assert!(!report.more_work_remaining);
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
    fail_first: bool,
}

#[async_trait]
impl MaintenanceHook for CountingHook {
    async fn run_maintenance(&self) -> Result<(), KyroGraphError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && call == 0 {
            return Err(KyroGraphError::Maintenance("first attempt fails".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_maintenance_runs_once_after_completion() {
    let graph = graph();
    let model = ScriptedModel::new();
    let hook = Arc::new(CountingHook::default());
    let runner = runner(&graph, &model, config()).with_maintenance(hook.clone());

    runner.run(&chunks(2), false).await;
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert!(load(&graph).maintenance_completed);

    runner.run(&chunks(2), false).await;
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_maintenance_is_retried() {
    let graph = graph();
    let model = ScriptedModel::new();
    let hook = Arc::new(CountingHook {
        fail_first: true,
        ..CountingHook::default()
    });
    let runner = runner(&graph, &model, config()).with_maintenance(hook.clone());

    let first = runner.run(&chunks(1), false).await;
    assert!(first.errors.iter().any(|e| e.contains("maintenance")));
    assert!(!load(&graph).maintenance_completed);

    let second = runner.run(&chunks(1), false).await;
    assert_eq!(second.skipped, Some(SkipReason::AlreadyCompleted));
    assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
    assert!(load(&graph).maintenance_completed);
}

#[tokio::test]
async fn test_legacy_sentinel_counts_as_completed() {
    let graph = graph();
    std::fs::write(graph.paths.legacy_bootstrap_sentinel(), "2024-01-01T00:00:00Z").unwrap();

    let model = ScriptedModel::new();
    let report = runner(&graph, &model, config()).run(&chunks(2), false).await;
    assert_eq!(report.skipped, Some(SkipReason::AlreadyCompleted));
    assert_eq!(model.call_count(), 0);
    assert!(graph.paths.bootstrap_state().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_stops_before_lease_release() {
    let graph = graph();
    let model = Arc::new(SlowModel(ScriptedModel::new()));
    let config = BootstrapConfig {
        heartbeat_interval_ms: 1,
        concurrency: 2,
        ..config()
    };
    let runner = BootstrapRunner::new(graph.paths.clone(), graph.store.clone(), model, config);

    for _ in 0..25 {
        let report = runner.run(&chunks(4), true).await;
        assert_eq!(report.status, Some(BootstrapStatus::Completed));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(LeaseLock::read_record(graph.paths.root()).is_none());
        assert_eq!(load(&graph).status, BootstrapStatus::Completed);
    }
}

#[tokio::test]
async fn test_completed_skip_leaves_state_file_alone() {
    let graph = graph();
    let model = ScriptedModel::new();
    let runner = runner(&graph, &model, config());
    runner.run(&chunks(2), false).await;

    let path = graph.paths.bootstrap_state();
    let marked = format!("{}\n\n", std::fs::read_to_string(&path).unwrap());
    std::fs::write(&path, &marked).unwrap();

    let report = runner.run(&chunks(2), false).await;
    assert_eq!(report.skipped, Some(SkipReason::AlreadyCompleted));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), marked);
}
