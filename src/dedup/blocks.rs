//! Semantic blocks for the cross-check dedup pass.
//!
//! Coarser than the incremental pass: nodes are grouped by type and topic
//! domain, linked when similar enough and close enough in time, and blocks
//! are peeled off greedily around the best-connected node.

use std::collections::BTreeMap;

use crate::config::DedupConfig;
use crate::dedup::candidates::{by_score_desc, eligible, sort_clusters, time_apart, CandidateCluster, ScoredPair};
use crate::dedup::similarity::TextProfile;
use crate::node::{NodeType, RegistryEntry};

/// Topic domain of a canonical key: the first segment cut at the first
/// `_` or `-`.
///
/// # Examples
///
/// ```
/// use kyrograph::dedup::topic_domain;
///
/// assert_eq!(topic_domain("preferences_ui.theme"), "preferences");
/// assert_eq!(topic_domain("work-projects.kyro"), "work");
/// assert_eq!(topic_domain("facts.city"), "facts");
/// ```
#[must_use]
pub fn topic_domain(canonical_key: &str) -> &str {
    let head = canonical_key.split('.').next().unwrap_or(canonical_key);
    head.split(['_', '-']).next().unwrap_or(head)
}

/// Extracts semantic blocks from live nodes.
///
/// Blocks hold at most `config.max_block_size` members and come back
/// ordered by score, capped at `config.max_blocks`.
#[must_use]
pub fn find_semantic_blocks(entries: &[RegistryEntry], config: &DedupConfig) -> Vec<CandidateCluster> {
    let eligible = eligible(entries);
    let profiles: Vec<TextProfile> = eligible
        .iter()
        .map(|entry| TextProfile::new(&entry.comparison_text()))
        .collect();

    let mut groups: BTreeMap<(NodeType, &str), Vec<usize>> = BTreeMap::new();
    for (index, entry) in eligible.iter().enumerate() {
        groups
            .entry((entry.node_type, topic_domain(&entry.canonical_key)))
            .or_default()
            .push(index);
    }

    let window = config.block_window();
    let mut blocks = Vec::new();
    for members in groups.values() {
        let mut edges = Vec::new();
        for (offset, &left) in members.iter().enumerate() {
            for &right in &members[offset + 1..] {
                if time_apart(eligible[left].created_at, eligible[right].created_at) > window {
                    continue;
                }
                let score = profiles[left].score(&profiles[right]);
                if score >= config.block_threshold {
                    edges.push(ScoredPair { left, right, score });
                }
            }
        }
        edges.sort_by(by_score_desc);

        for (seed, block, score) in extract_blocks(members, &edges, config.max_block_size) {
            let mut indices = block;
            indices.push(seed);
            indices.sort_unstable();
            blocks.push(CandidateCluster {
                members: indices.into_iter().map(|i| eligible[i].clone()).collect(),
                max_score: score,
            });
        }
    }

    sort_clusters(&mut blocks);
    blocks.truncate(config.max_blocks);
    tracing::debug!(eligible = eligible.len(), blocks = blocks.len(), "semantic blocks generated");
    blocks
}

/// Greedy max-degree extraction.
///
/// Repeatedly picks the remaining node with the most remaining neighbours
/// (lowest index on ties), takes its best neighbours up to the size cap and
/// removes them all. Returns `(seed, neighbours, best edge score)`.
fn extract_blocks(
    members: &[usize],
    edges: &[ScoredPair],
    max_block_size: usize,
) -> Vec<(usize, Vec<usize>, f64)> {
    let mut remaining: Vec<usize> = members.to_vec();
    let mut blocks = Vec::new();

    loop {
        let live_edges: Vec<&ScoredPair> = edges
            .iter()
            .filter(|e| remaining.contains(&e.left) && remaining.contains(&e.right))
            .collect();

        let seed = remaining
            .iter()
            .map(|&node| {
                let degree = live_edges
                    .iter()
                    .filter(|e| e.left == node || e.right == node)
                    .count();
                (degree, node)
            })
            .filter(|&(degree, _)| degree > 0)
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let Some((_, seed)) = seed else {
            break;
        };

        // Edges are already in descending score order.
        let neighbours: Vec<(usize, f64)> = live_edges
            .iter()
            .filter_map(|e| match (e.left == seed, e.right == seed) {
                (true, _) => Some((e.right, e.score)),
                (_, true) => Some((e.left, e.score)),
                _ => None,
            })
            .take(max_block_size.saturating_sub(1))
            .collect();

        let best = neighbours.first().map_or(0.0, |&(_, score)| score);
        let block: Vec<usize> = neighbours.into_iter().map(|(node, _)| node).collect();
        remaining.retain(|node| *node != seed && !block.contains(node));
        blocks.push((seed, block, best));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::KnowledgeNode;
    use chrono::{Duration, Utc};

    fn entry(node_type: NodeType, key: &str, description: &str) -> RegistryEntry {
        let node = KnowledgeNode::new(node_type, key, description);
        let path = format!("nodes/{}.md", node.id);
        node.to_entry(path)
    }

    #[test]
    fn test_topic_domain() {
        assert_eq!(topic_domain("preferences_ui.theme"), "preferences");
        assert_eq!(topic_domain("preferences.theme"), "preferences");
        assert_eq!(topic_domain("plain"), "plain");
        assert_eq!(topic_domain(""), "");
    }

    #[test]
    fn test_blocks_cross_key_heads_within_domain() {
        let entries = vec![
            entry(NodeType::Preference, "preferences_ui.theme", "prefers a dark theme everywhere"),
            entry(NodeType::Preference, "preferences_editor.theme", "prefers a dark theme in the editor"),
            entry(NodeType::Preference, "hobbies.music", "listens to jazz records"),
        ];
        let blocks = find_semantic_blocks(&entries, &DedupConfig::default());
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains(&entries[0].id));
        assert!(blocks[0].contains(&entries[1].id));
    }

    #[test]
    fn test_blocks_respect_time_window() {
        let now = Utc::now();
        let mut a = entry(NodeType::Fact, "facts_home.city", "lives in lisbon portugal");
        let mut b = entry(NodeType::Fact, "facts_home.town", "lives in lisbon portugal");
        a.created_at = now - Duration::days(90);
        b.created_at = now;
        assert!(find_semantic_blocks(&[a.clone(), b.clone()], &DedupConfig::default()).is_empty());

        b.created_at = now - Duration::days(80);
        assert_eq!(find_semantic_blocks(&[a, b], &DedupConfig::default()).len(), 1);
    }

    #[test]
    fn test_blocks_capped_in_size_and_count() {
        let entries: Vec<_> = (0..7)
            .map(|i| entry(NodeType::Fact, &format!("facts.k{i}"), "drinks green tea every morning"))
            .collect();
        let config = DedupConfig {
            max_block_size: 3,
            ..DedupConfig::default()
        };
        let blocks = find_semantic_blocks(&entries, &config);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.len() <= 3 && b.len() >= 2));

        let capped = DedupConfig {
            max_block_size: 3,
            max_blocks: 1,
            ..DedupConfig::default()
        };
        assert_eq!(find_semantic_blocks(&entries, &capped).len(), 1);
    }

    #[test]
    fn test_extract_prefers_highest_degree_seed() {
        // 0 links to 1, 2, 3; 1 links to 2 only.
        let edges = vec![
            ScoredPair { left: 0, right: 1, score: 0.9 },
            ScoredPair { left: 1, right: 2, score: 0.8 },
            ScoredPair { left: 0, right: 2, score: 0.7 },
            ScoredPair { left: 0, right: 3, score: 0.6 },
        ];
        let blocks = extract_blocks(&[0, 1, 2, 3, 4], &edges, 3);
        assert_eq!(blocks.len(), 1);
        let (seed, members, best) = &blocks[0];
        assert_eq!(*seed, 0);
        assert_eq!(members, &vec![1, 2]);
        assert!((best - 0.9).abs() < f64::EPSILON);
    }
}
