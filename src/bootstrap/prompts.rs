//! Prompt construction and response parsing for bootstrap batches.

use serde_json::Value;

use crate::bootstrap::batcher::SourceChunk;
use crate::error::ResponseError;
use crate::model::extract_json_object;
use crate::node::{NodeDraft, NodeType};

/// System and user prompt for one model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Builds bootstrap prompts and parses the model's answer into node drafts.
pub trait BootstrapPrompter: Send + Sync {
    fn build(&self, batch: &[SourceChunk]) -> Prompt;

    /// # Errors
    /// Returns a `ResponseError` when the text does not have the expected shape.
    fn parse(&self, text: &str) -> Result<Vec<NodeDraft>, ResponseError>;
}

/// Default prompter speaking the `{"nodes": [...]}` JSON contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBootstrapPrompter;

const SYSTEM_PROMPT: &str = "You extract durable knowledge about the user from conversation \
history. Reply with a single JSON object of the form \
{\"nodes\": [{\"type\": ..., \"canonicalKey\": ..., \"description\": ..., \
\"tags\": [...], \"links\": [...], \"body\": ..., \"priority\": ...}]}. \
canonicalKey is a stable dotted concept key such as preferences.editor_theme. \
Only type, canonicalKey and description are required. Reply with {\"nodes\": []} \
when nothing is worth keeping.";

impl BootstrapPrompter for JsonBootstrapPrompter {
    fn build(&self, batch: &[SourceChunk]) -> Prompt {
        let types = NodeType::ALL
            .iter()
            .filter(|ty| !ty.is_structural())
            .map(|ty| ty.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut user = format!("Allowed types: {types}.\n");
        for (index, chunk) in batch.iter().enumerate() {
            user.push_str(&format!(
                "\n<source index=\"{index}\" name=\"{}\">\n{}\n</source>\n",
                chunk.source, chunk.text
            ));
        }
        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    fn parse(&self, text: &str) -> Result<Vec<NodeDraft>, ResponseError> {
        let root = extract_json_object(text)?;
        let Some(entries) = root.get("nodes").and_then(Value::as_array) else {
            return Err(ResponseError::MissingField {
                field: "nodes".to_string(),
            });
        };

        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let draft: NodeDraft = serde_json::from_value(entry.clone()).map_err(|e| {
                    ResponseError::InvalidEntry {
                        index,
                        reason: e.to_string(),
                    }
                })?;
                if draft.canonical_key.trim().is_empty() {
                    return Err(ResponseError::InvalidEntry {
                        index,
                        reason: "empty canonicalKey".to_string(),
                    });
                }
                if draft.node_type.is_structural() {
                    return Err(ResponseError::InvalidEntry {
                        index,
                        reason: format!("type {} is reserved", draft.node_type),
                    });
                }
                Ok(draft)
            })
            .collect()
    }
}
