//! External model collaborator.
//!
//! Both pipelines talk to the model through a single `generate` call. The
//! error it returns is classified three ways so callers can branch between
//! shared backoff, aborting every worker, or failing one unit of work.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ResponseError};

/// Text produced by one model call plus its token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Generation {
    /// Total tokens consumed by the call.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Trait contract for the external model.
#[async_trait]
pub trait ExternalModel: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
    ) -> Result<Generation, ModelError>;
}

/// Maps an HTTP status from a model provider to the error classification.
///
/// Adapters wrapping an HTTP client use this so every provider shares one
/// backoff policy.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> ModelError {
    let message = format!("status {status}: {body}");
    match status {
        429 => ModelError::rate_limited(message),
        408 | 502 | 503 | 504 => ModelError::unreachable(message),
        _ => ModelError::other(message),
    }
}

/// Calls the model with a deadline; a timeout is classified as unreachable.
///
/// # Errors
/// Returns the model's own error, or `ModelError::Unreachable` on timeout.
pub async fn call_with_timeout(
    model: &dyn ExternalModel,
    system_prompt: &str,
    user_prompt: &str,
    max_output_tokens: u32,
    timeout: Duration,
) -> Result<Generation, ModelError> {
    match tokio::time::timeout(
        timeout,
        model.generate(system_prompt, user_prompt, max_output_tokens),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ModelError::unreachable(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Extracts the first balanced JSON object from model output.
///
/// Models wrap JSON in prose or code fences; the scan starts at the first
/// `{` that opens a parseable object and tracks string literals so braces
/// inside strings do not count.
///
/// # Errors
/// Returns `ResponseError::NoJson` when no object is found and
/// `ResponseError::Malformed` when the balanced span fails to parse.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value, ResponseError> {
    let mut last_error = None;
    for (start, _) in text.match_indices('{') {
        let Some(end) = balanced_end(&text[start..]) else {
            continue;
        };
        match serde_json::from_str::<serde_json::Value>(&text[start..start + end]) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => {}
            Err(err) => {
                last_error.get_or_insert_with(|| err.to_string());
            }
        }
    }
    Err(last_error.map_or(ResponseError::NoJson, |reason| ResponseError::Malformed { reason }))
}

/// Byte length of the balanced `{...}` span at the start of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
