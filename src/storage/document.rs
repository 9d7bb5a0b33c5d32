//! Node document codec.
//!
//! # File Format
//! ```text
//! ---
//! { ...node metadata as JSON, camelCase... }
//! ---
//! body text
//! ```

use std::path::Path;

use crate::error::StorageError;
use crate::node::KnowledgeNode;

const FENCE: &str = "---";

/// Renders a node as a frontmatter document.
///
/// # Errors
/// Returns `StorageError::Serialization` if the metadata cannot be encoded.
pub fn render_node(node: &KnowledgeNode) -> Result<String, StorageError> {
    let meta = serde_json::to_string_pretty(node)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut out = String::with_capacity(meta.len() + node.body.len() + 16);
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(&meta);
    out.push('\n');
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(&node.body);
    Ok(out)
}

/// Parses a frontmatter document read from `path`.
///
/// # Errors
/// Returns `StorageError::Parse` if the fences are missing or the metadata is
/// not a valid node record.
pub fn parse_node(path: &Path, text: &str) -> Result<KnowledgeNode, StorageError> {
    let parse_err = |reason: &str| StorageError::Parse {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Err(parse_err("empty document"));
    };
    if first.trim_end() != FENCE {
        return Err(parse_err("missing opening frontmatter fence"));
    }

    let mut meta = String::new();
    let mut consumed = first.len();
    let mut closed = false;
    for line in lines {
        consumed += line.len();
        if line.trim_end() == FENCE {
            closed = true;
            break;
        }
        meta.push_str(line);
    }
    if !closed {
        return Err(parse_err("missing closing frontmatter fence"));
    }

    let mut node: KnowledgeNode =
        serde_json::from_str(&meta).map_err(|e| parse_err(&e.to_string()))?;
    if node.id.as_str().is_empty() {
        return Err(parse_err("node id is empty"));
    }
    node.body = text[consumed..].to_string();
    Ok(node)
}
