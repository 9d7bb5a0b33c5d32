//! Prompt construction and response parsing for dedup confirmation.

use serde_json::{json, Value};

use crate::bootstrap::prompts::Prompt;
use crate::dedup::candidates::CandidateCluster;
use crate::dedup::merge::MergePlan;
use crate::dedup::runner::DedupMode;
use crate::error::ResponseError;
use crate::model::extract_json_object;

/// Builds dedup prompts and parses the model's merge plans.
pub trait DedupPrompter: Send + Sync {
    fn build(&self, clusters: &[CandidateCluster], mode: DedupMode) -> Prompt;

    /// An empty list is a valid "no true duplicates" verdict.
    ///
    /// # Errors
    /// Returns a `ResponseError` when the text does not have the expected shape.
    fn parse(&self, text: &str) -> Result<Vec<MergePlan>, ResponseError>;
}

/// Default prompter speaking the `{"merges": [...]}` JSON contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDedupPrompter;

const SYSTEM_PROMPT: &str = "You review clusters of knowledge records that may describe the same \
concept. Merge only records that are true duplicates; records that merely share a topic stay \
separate. Reply with a single JSON object \
{\"merges\": [{\"keeper\": id, \"losers\": [id, ...], \"aliases\": [key, ...], \
\"conflicts\": [{\"field\": ..., \"detail\": ...}], \"patch\": {\"description\": ..., \
\"tags\": [...], \"links\": [id, ...], \"bodyAppend\": ...}}]}. \
keeper and losers must come from the same cluster. List a field under conflicts when the \
records disagree about it. Reply with {\"merges\": []} when nothing should merge.";

const CROSS_CHECK_NOTE: &str = "These blocks were grouped loosely by topic across different \
keys; be conservative.";

impl DedupPrompter for JsonDedupPrompter {
    fn build(&self, clusters: &[CandidateCluster], mode: DedupMode) -> Prompt {
        let payload: Vec<Value> = clusters
            .iter()
            .enumerate()
            .map(|(index, cluster)| {
                let members: Vec<Value> = cluster
                    .members
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "type": m.node_type,
                            "canonicalKey": m.canonical_key,
                            "description": m.description,
                            "tags": m.tags,
                            "aliases": m.aliases,
                            "updatedAt": m.updated_at,
                        })
                    })
                    .collect();
                json!({ "cluster": index, "members": members })
            })
            .collect();

        let mut user = String::new();
        if mode == DedupMode::CrossCheck {
            user.push_str(CROSS_CHECK_NOTE);
            user.push('\n');
        }
        user.push_str(&format!("{:#}", Value::Array(payload)));
        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    fn parse(&self, text: &str) -> Result<Vec<MergePlan>, ResponseError> {
        let root = extract_json_object(text)?;
        let Some(entries) = root.get("merges").and_then(Value::as_array) else {
            return Err(ResponseError::MissingField {
                field: "merges".to_string(),
            });
        };
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                serde_json::from_value(entry.clone()).map_err(|e| ResponseError::InvalidEntry {
                    index,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}
