//! Merge plans and their execution.
//!
//! # Data-loss guard
//!
//! The keeper is resolved, read and written before any loser is touched. If
//! the keeper cannot be located, read or parsed, the merge fails and every
//! loser document stays byte-identical.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dedup::audit::{AuditEntry, AuditLog};
use crate::error::MergeError;
use crate::node::{KnowledgeNode, NodeId};
use crate::storage::GraphStore;

/// Partial overrides applied to the keeper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_append: Option<String>,
}

impl FieldPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.tags.is_empty()
            && self.links.is_empty()
            && self.body_append.is_none()
    }

    /// Drops the overrides for `field` (`description`, `tags`, `links` or `body`).
    fn without(mut self, field: &str) -> Self {
        match field {
            "description" => self.description = None,
            "tags" => self.tags.clear(),
            "links" => self.links.clear(),
            "body" | "bodyAppend" | "body_append" => self.body_append = None,
            _ => {}
        }
        self
    }
}

/// A disagreement between cluster members the model chose not to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: String,
    #[serde(default)]
    pub detail: String,
}

/// A model-approved merge of `losers` into `keeper`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub keeper: NodeId,
    pub losers: Vec<NodeId>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub patch: FieldPatch,
}

impl MergePlan {
    /// The patch minus every field named by a conflict.
    #[must_use]
    pub fn effective_patch(&self) -> FieldPatch {
        self.conflicts
            .iter()
            .fold(self.patch.clone(), |patch, conflict| patch.without(&conflict.field))
    }

    /// Structural checks that need no storage access.
    ///
    /// # Errors
    /// Returns `MergeError::InvalidPlan` naming the problem.
    pub fn check_shape(&self) -> Result<(), MergeError> {
        let invalid = |reason: &str| MergeError::InvalidPlan {
            keeper: self.keeper.clone(),
            reason: reason.to_string(),
        };
        if self.losers.is_empty() {
            return Err(invalid("plan has no losers"));
        }
        if self.losers.contains(&self.keeper) {
            return Err(invalid("keeper is listed among the losers"));
        }
        Ok(())
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) -> bool {
    if list.contains(&value) {
        false
    } else {
        list.push(value);
        true
    }
}

/// Applies `patch` and `aliases` to a copy of `node`.
///
/// Tags, links and aliases are unioned without duplicates; description and
/// body change only when the patch supplies them. The node's own key is
/// never added as an alias, nor its own id as a link.
#[must_use]
pub fn apply_patch(node: &KnowledgeNode, patch: &FieldPatch, aliases: &[String]) -> KnowledgeNode {
    let mut next = node.clone();
    if let Some(description) = patch.description.as_deref().filter(|d| !d.trim().is_empty()) {
        next.description = description.to_string();
    }
    for tag in &patch.tags {
        push_unique(&mut next.tags, tag.clone());
    }
    for link in &patch.links {
        if link != &next.id {
            push_unique(&mut next.links, link.clone());
        }
    }
    if let Some(extra) = patch.body_append.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        if !next.body.is_empty() {
            next.body.push_str("\n\n");
        }
        next.body.push_str(extra);
    }
    for alias in aliases {
        if alias != &next.canonical_key {
            push_unique(&mut next.aliases, alias.clone());
        }
    }
    next.touch();
    next
}

/// Result of one executed merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub audit: AuditEntry,
    /// Losers actually archived.
    pub archived: usize,
    /// Other nodes whose links were redirected to the keeper.
    pub redirected: usize,
}

/// Executes merge plans against a graph store.
pub struct MergeExecutor<'a> {
    store: &'a dyn GraphStore,
    audit: &'a AuditLog,
}

impl<'a> MergeExecutor<'a> {
    #[must_use]
    pub fn new(store: &'a dyn GraphStore, audit: &'a AuditLog) -> Self {
        Self { store, audit }
    }

    /// Executes `plan` using `locations` to find node documents.
    ///
    /// Unknown or unreadable losers are skipped and left out of the
    /// archived count. The audit entry is appended best-effort.
    ///
    /// # Errors
    /// Returns a `MergeError` when the plan is malformed or the keeper
    /// cannot be resolved, read, or written. No loser has been modified
    /// when this happens.
    pub fn execute(
        &self,
        plan: &MergePlan,
        locations: &HashMap<NodeId, PathBuf>,
    ) -> Result<MergeOutcome, MergeError> {
        plan.check_shape()?;

        let keeper_path = locations
            .get(&plan.keeper)
            .cloned()
            .ok_or_else(|| MergeError::KeeperUnknown {
                keeper: plan.keeper.clone(),
            })?;
        let keeper = self
            .store
            .read_node(&keeper_path)
            .map_err(|source| MergeError::KeeperUnreadable {
                keeper: plan.keeper.clone(),
                path: keeper_path.clone(),
                source,
            })?;
        if keeper.archived {
            return Err(MergeError::KeeperArchived {
                keeper: plan.keeper.clone(),
            });
        }

        let mut losers: Vec<(PathBuf, KnowledgeNode)> = Vec::new();
        for loser_id in &plan.losers {
            let Some(path) = locations.get(loser_id) else {
                tracing::warn!(keeper = %plan.keeper, loser = %loser_id, "loser has no known location; skipping");
                continue;
            };
            match self.store.read_node(path) {
                Ok(node) if node.archived => {
                    tracing::warn!(loser = %loser_id, "loser already archived; skipping");
                }
                Ok(node) => losers.push((path.clone(), node)),
                Err(err) => {
                    tracing::warn!(loser = %loser_id, error = %err, "loser unreadable; skipping");
                }
            }
        }

        let mut absorbed_keys = plan.aliases.clone();
        for (_, loser) in &losers {
            push_unique(&mut absorbed_keys, loser.canonical_key.clone());
            for alias in &loser.aliases {
                push_unique(&mut absorbed_keys, alias.clone());
            }
        }

        let patch = plan.effective_patch();
        let mut patched = apply_patch(&keeper, &patch, &absorbed_keys);
        // Skipped losers stay live, so links to them must survive.
        let absorbed_ids: Vec<&NodeId> = losers.iter().map(|(_, loser)| &loser.id).collect();
        patched.links.retain(|link| !absorbed_ids.contains(&link));
        let aliases_added: Vec<String> = patched
            .aliases
            .iter()
            .filter(|alias| !keeper.aliases.contains(alias))
            .cloned()
            .collect();

        self.store
            .write_node(&keeper_path, &patched)
            .map_err(|source| MergeError::KeeperWriteFailed {
                keeper: plan.keeper.clone(),
                path: keeper_path.clone(),
                source,
            })?;

        let mut archived_ids = Vec::new();
        for (path, mut loser) in losers {
            loser.archive_into(&plan.keeper);
            match self.store.write_node(&path, &loser) {
                Ok(()) => archived_ids.push(loser.id),
                Err(err) => {
                    tracing::warn!(loser = %loser.id, error = %err, "failed to archive loser");
                }
            }
        }

        let redirected = self.redirect_links(&plan.keeper, &archived_ids);

        let audit = AuditEntry {
            timestamp: Utc::now(),
            keeper: plan.keeper.clone(),
            losers: archived_ids,
            aliases_added,
            conflicts: plan.conflicts.clone(),
            patch,
        };
        if let Err(err) = self.audit.append(&audit) {
            tracing::warn!(keeper = %plan.keeper, error = %err, "audit append failed");
        }
        tracing::info!(
            keeper = %plan.keeper,
            archived = audit.losers.len(),
            redirected,
            "merge executed"
        );

        Ok(MergeOutcome {
            archived: audit.losers.len(),
            redirected,
            audit,
        })
    }

    /// Rewrites links pointing at `archived` so they point at `keeper`.
    fn redirect_links(&self, keeper: &NodeId, archived: &[NodeId]) -> usize {
        if archived.is_empty() {
            return 0;
        }
        let registry = match self.store.registry() {
            Ok(registry) => registry,
            Err(err) => {
                tracing::warn!(error = %err, "registry unavailable; inbound links not redirected");
                return 0;
            }
        };

        let mut redirected = 0;
        for entry in registry {
            if archived.contains(&entry.id) || !entry.links.iter().any(|l| archived.contains(l)) {
                continue;
            }
            let mut node = match self.store.read_node(&entry.path) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(node = %entry.id, error = %err, "cannot redirect links");
                    continue;
                }
            };

            let mut links = Vec::with_capacity(node.links.len());
            for link in node.links.drain(..) {
                let target = if archived.contains(&link) { keeper.clone() } else { link };
                if target != node.id {
                    push_unique(&mut links, target);
                }
            }
            node.links = links;
            node.touch();
            match self.store.write_node(&entry.path, &node) {
                Ok(()) => redirected += 1,
                Err(err) => tracing::warn!(node = %entry.id, error = %err, "link redirect write failed"),
            }
        }
        redirected
    }
}
