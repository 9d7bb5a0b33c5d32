//! Candidate generation and clustering for the incremental dedup pass.
//!
//! Pairs are only scored inside a bucket of the same node type and first
//! canonical-key segment, which keeps the pass far below quadratic in the
//! size of the graph. Retained pairs are clustered with a size-capped
//! union-find processed in descending score order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::DedupConfig;
use crate::dedup::similarity::TextProfile;
use crate::node::{NodeId, NodeType, RegistryEntry};

/// A group of nodes that may duplicate one another.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateCluster {
    /// Members ordered by id.
    pub members: Vec<RegistryEntry>,
    /// Highest pairwise score seen inside the cluster.
    pub max_score: f64,
}

impl CandidateCluster {
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|member| &member.id == id)
    }

    #[must_use]
    pub fn member(&self, id: &NodeId) -> Option<&RegistryEntry> {
        self.members.iter().find(|member| &member.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A scored pair of indices into the eligible entry list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScoredPair {
    pub(crate) left: usize,
    pub(crate) right: usize,
    pub(crate) score: f64,
}

/// Entries that can take part in a merge, ordered by id.
///
/// Archived nodes and structural types never do.
pub(crate) fn eligible(entries: &[RegistryEntry]) -> Vec<&RegistryEntry> {
    let mut eligible: Vec<&RegistryEntry> = entries
        .iter()
        .filter(|entry| !entry.archived && !entry.node_type.is_structural())
        .collect();
    eligible.sort_by(|a, b| a.id.cmp(&b.id));
    eligible
}

/// Descending score, then ascending indices.
pub(crate) fn by_score_desc(a: &ScoredPair, b: &ScoredPair) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.left.cmp(&b.left))
        .then(a.right.cmp(&b.right))
}

/// Orders clusters by descending score, then by first member id.
pub(crate) fn sort_clusters(clusters: &mut [CandidateCluster]) {
    clusters.sort_by(|a, b| {
        b.max_score
            .total_cmp(&a.max_score)
            .then_with(|| a.members.first().map(|m| &m.id).cmp(&b.members.first().map(|m| &m.id)))
    });
}

/// Union-find with component sizes and the best score per component.
#[derive(Debug)]
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
    best: Vec<f64>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
            best: vec![0.0; len],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    /// Joins the components of `a` and `b` unless the result would exceed
    /// `max_size`. Returns whether both now share a component.
    fn union_capped(&mut self, a: usize, b: usize, score: f64, max_size: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            self.best[ra] = self.best[ra].max(score);
            return true;
        }
        if self.size[ra] + self.size[rb] > max_size {
            return false;
        }
        let (root, child) = if self.size[ra] >= self.size[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        self.size[root] += self.size[child];
        self.best[root] = self.best[root].max(self.best[child]).max(score);
        true
    }
}

pub(crate) fn time_apart(a: DateTime<Utc>, b: DateTime<Utc>) -> chrono::Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

fn passes_filters(
    a: &RegistryEntry,
    b: &RegistryEntry,
    last_dedup_at: Option<DateTime<Utc>>,
    config: &DedupConfig,
) -> bool {
    if let Some(since) = last_dedup_at {
        if a.updated_at < since && b.updated_at < since {
            return false;
        }
    }
    !(config.volatile_types.contains(&a.node_type)
        && time_apart(a.created_at, b.created_at) > config.volatile_window())
}

/// Groups live nodes into candidate-duplicate clusters.
///
/// With `last_dedup_at` set, a pair is skipped when neither node changed
/// since that run. Clusters come back ordered by `max_score`, capped at
/// `config.max_clusters`.
#[must_use]
pub fn find_candidate_clusters(
    entries: &[RegistryEntry],
    last_dedup_at: Option<DateTime<Utc>>,
    config: &DedupConfig,
) -> Vec<CandidateCluster> {
    let eligible = eligible(entries);
    let profiles: Vec<TextProfile> = eligible
        .iter()
        .map(|entry| TextProfile::new(&entry.comparison_text()))
        .collect();

    let mut buckets: BTreeMap<(NodeType, &str), Vec<usize>> = BTreeMap::new();
    for (index, entry) in eligible.iter().enumerate() {
        buckets
            .entry((entry.node_type, entry.key_head()))
            .or_default()
            .push(index);
    }

    let mut retained = Vec::new();
    for members in buckets.values() {
        let mut pairs = Vec::new();
        for (offset, &left) in members.iter().enumerate() {
            for &right in &members[offset + 1..] {
                if !passes_filters(eligible[left], eligible[right], last_dedup_at, config) {
                    continue;
                }
                let score = profiles[left].score(&profiles[right]);
                if score >= config.similarity_threshold {
                    pairs.push(ScoredPair { left, right, score });
                }
            }
        }
        pairs.sort_by(by_score_desc);
        pairs.truncate(config.max_pairs_per_bucket);
        retained.extend(pairs);
    }
    retained.sort_by(by_score_desc);

    let mut sets = DisjointSet::new(eligible.len());
    for pair in &retained {
        sets.union_capped(pair.left, pair.right, pair.score, config.max_cluster_size);
    }

    let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..eligible.len() {
        let root = sets.find(index);
        grouped.entry(root).or_default().push(index);
    }

    let mut clusters: Vec<CandidateCluster> = grouped
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(root, members)| CandidateCluster {
            members: members.into_iter().map(|i| eligible[i].clone()).collect(),
            max_score: sets.best[root],
        })
        .collect();
    sort_clusters(&mut clusters);
    clusters.truncate(config.max_clusters);

    tracing::debug!(
        eligible = eligible.len(),
        pairs = retained.len(),
        clusters = clusters.len(),
        "candidate clusters generated"
    );
    clusters
}
