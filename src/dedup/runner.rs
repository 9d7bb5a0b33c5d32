//! Dedup orchestrator.
//!
//! One pass: generate clusters, ask the model which are true duplicates,
//! execute the approved plans. The pass is fail-closed: `lastDedupAt` only
//! moves when the model round trip and every plan check succeeded, so a
//! flaky call is never mistaken for "nothing to do".

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bootstrap::runner::MaintenanceHook;
use crate::config::DedupConfig;
use crate::dedup::audit::AuditLog;
use crate::dedup::blocks::find_semantic_blocks;
use crate::dedup::candidates::{find_candidate_clusters, CandidateCluster};
use crate::dedup::merge::{MergeExecutor, MergePlan};
use crate::dedup::prompts::{DedupPrompter, JsonDedupPrompter};
use crate::dedup::state::DedupStateStore;
use crate::error::{KyroGraphError, MergeError};
use crate::model::{call_with_timeout, ExternalModel};
use crate::node::NodeId;
use crate::storage::{GraphPaths, GraphStore};

/// Which candidate pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Bucketed clusters scoped to nodes changed since the last run.
    #[default]
    Incremental,
    /// Semantic blocks over every live node.
    CrossCheck,
}

/// Outcome of one dedup pass. `errors` is empty on full success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub mode: DedupMode,
    pub clusters_processed: usize,
    pub merges_executed: usize,
    pub nodes_archived: usize,
    pub tokens_used: u64,
    pub errors: Vec<String>,
}

/// Checks a plan against the clusters that were sent to the model.
fn validate_plan(
    plan: &MergePlan,
    clusters: &[CandidateCluster],
    claimed: &HashSet<NodeId>,
) -> Result<(), MergeError> {
    plan.check_shape()?;
    let invalid = |reason: String| MergeError::InvalidPlan {
        keeper: plan.keeper.clone(),
        reason,
    };

    let Some(cluster) = clusters.iter().find(|c| c.contains(&plan.keeper)) else {
        return Err(invalid("keeper is not in any submitted cluster".to_string()));
    };
    if let Some(stranger) = plan.losers.iter().find(|loser| !cluster.contains(loser)) {
        return Err(invalid(format!("loser {stranger} is not in the keeper's cluster")));
    }
    let mut seen = HashSet::new();
    for id in std::iter::once(&plan.keeper).chain(&plan.losers) {
        if !seen.insert(id) {
            return Err(invalid(format!("{id} is listed twice")));
        }
        if claimed.contains(id) {
            return Err(invalid(format!("{id} already belongs to another plan")));
        }
    }
    Ok(())
}

/// Periodic dedup pass over one graph.
pub struct DedupRunner {
    paths: GraphPaths,
    store: Arc<dyn GraphStore>,
    model: Arc<dyn ExternalModel>,
    prompter: Arc<dyn DedupPrompter>,
    config: DedupConfig,
}

impl DedupRunner {
    #[must_use]
    pub fn new(
        paths: GraphPaths,
        store: Arc<dyn GraphStore>,
        model: Arc<dyn ExternalModel>,
        config: DedupConfig,
    ) -> Self {
        Self {
            paths,
            store,
            model,
            prompter: Arc::new(JsonDedupPrompter),
            config,
        }
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn DedupPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Runs one dedup pass.
    ///
    /// Model, parse and plan failures are recorded in the report.
    ///
    /// # Errors
    /// Returns the `MergeError` of a merge whose keeper could not be
    /// resolved, read or written. No loser of that merge was touched.
    pub async fn run(&self, mode: DedupMode) -> Result<DedupReport, MergeError> {
        let mut report = DedupReport {
            mode,
            ..DedupReport::default()
        };
        let started_at = Utc::now();
        let state_store = DedupStateStore::new(self.paths.clone());
        let state = state_store.load();

        let registry = match self.store.registry() {
            Ok(registry) => registry,
            Err(err) => {
                report.errors.push(format!("registry scan failed: {err}"));
                return Ok(report);
            }
        };

        let clusters = match mode {
            DedupMode::Incremental => {
                find_candidate_clusters(&registry, state.last_dedup_at, &self.config)
            }
            DedupMode::CrossCheck => find_semantic_blocks(&registry, &self.config),
        };
        if clusters.is_empty() {
            tracing::debug!(?mode, "no dedup candidates");
            return Ok(report);
        }

        let prompt = self.prompter.build(&clusters, mode);
        let generation = match call_with_timeout(
            self.model.as_ref(),
            &prompt.system,
            &prompt.user,
            self.config.max_output_tokens,
            self.config.call_timeout(),
        )
        .await
        {
            Ok(generation) => generation,
            Err(err) => {
                tracing::warn!(error = %err, "dedup model call failed; state not advanced");
                report.errors.push(format!("model call failed: {err}"));
                return Ok(report);
            }
        };
        report.tokens_used = generation.total_tokens();

        let plans = match self.prompter.parse(&generation.text) {
            Ok(plans) => plans,
            Err(err) => {
                tracing::warn!(error = %err, "dedup response rejected; state not advanced");
                report.errors.push(format!("invalid model response: {err}"));
                return Ok(report);
            }
        };
        report.clusters_processed = clusters.len();

        let mut claimed: HashSet<NodeId> = HashSet::new();
        let mut approved = Vec::new();
        for plan in plans {
            match validate_plan(&plan, &clusters, &claimed) {
                Ok(()) => {
                    claimed.insert(plan.keeper.clone());
                    claimed.extend(plan.losers.iter().cloned());
                    approved.push(plan);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rejecting merge plan");
                    report.errors.push(err.to_string());
                }
            }
        }

        let locations: HashMap<NodeId, PathBuf> = registry
            .into_iter()
            .map(|entry| (entry.id, entry.path))
            .collect();
        let audit = AuditLog::new(self.paths.audit_log());
        let executor = MergeExecutor::new(self.store.as_ref(), &audit);
        for plan in &approved {
            match executor.execute(plan, &locations) {
                Ok(outcome) => {
                    report.merges_executed += 1;
                    report.nodes_archived += outcome.archived;
                }
                Err(err) => {
                    tracing::error!(keeper = %err.keeper(), error = %err, "merge aborted");
                    return Err(err);
                }
            }
        }

        if report.errors.is_empty() {
            let merges = u64::try_from(report.merges_executed).unwrap_or(u64::MAX);
            if let Err(err) = state_store.save(&state.advance(started_at, merges)) {
                report.errors.push(format!("dedup state write failed: {err}"));
            }
        } else {
            tracing::warn!(errors = report.errors.len(), "dedup errors recorded; state not advanced");
        }

        tracing::info!(
            ?mode,
            clusters = report.clusters_processed,
            merges = report.merges_executed,
            archived = report.nodes_archived,
            tokens = report.tokens_used,
            "dedup pass finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl MaintenanceHook for DedupRunner {
    async fn run_maintenance(&self) -> Result<(), KyroGraphError> {
        let report = self.run(DedupMode::Incremental).await?;
        if report.errors.is_empty() {
            Ok(())
        } else {
            Err(KyroGraphError::Maintenance(report.errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::merge::FieldPatch;
    use crate::node::{KnowledgeNode, NodeType};

    fn cluster(ids: &[&str]) -> CandidateCluster {
        CandidateCluster {
            members: ids
                .iter()
                .map(|id| {
                    KnowledgeNode::with_id(NodeId::from(*id), NodeType::Fact, format!("facts.{id}"), "x")
                        .to_entry(format!("{id}.md"))
                })
                .collect(),
            max_score: 1.0,
        }
    }

    fn plan(keeper: &str, losers: &[&str]) -> MergePlan {
        MergePlan {
            keeper: NodeId::from(keeper),
            losers: losers.iter().map(|l| NodeId::from(*l)).collect(),
            aliases: Vec::new(),
            conflicts: Vec::new(),
            patch: FieldPatch::default(),
        }
    }

    #[test]
    fn test_validate_accepts_plan_within_cluster() {
        let clusters = [cluster(&["a", "b", "c"]), cluster(&["d", "e"])];
        assert!(validate_plan(&plan("a", &["b", "c"]), &clusters, &HashSet::new()).is_ok());
        assert!(validate_plan(&plan("e", &["d"]), &clusters, &HashSet::new()).is_ok());
    }

    #[test]
    fn test_validate_rejects_cross_cluster_and_unknown() {
        let clusters = [cluster(&["a", "b"]), cluster(&["d", "e"])];
        let empty = HashSet::new();
        assert!(validate_plan(&plan("a", &["d"]), &clusters, &empty).is_err());
        assert!(validate_plan(&plan("z", &["a"]), &clusters, &empty).is_err());
        assert!(validate_plan(&plan("a", &[]), &clusters, &empty).is_err());
        assert!(validate_plan(&plan("a", &["a"]), &clusters, &empty).is_err());
        assert!(validate_plan(&plan("a", &["b", "b"]), &clusters, &empty).is_err());
    }

    #[test]
    fn test_validate_rejects_claimed_nodes() {
        let clusters = [cluster(&["a", "b", "c"])];
        let claimed: HashSet<NodeId> = [NodeId::from("b")].into_iter().collect();
        assert!(validate_plan(&plan("a", &["b"]), &clusters, &claimed).is_err());
        assert!(validate_plan(&plan("a", &["c"]), &clusters, &claimed).is_ok());
    }
}
