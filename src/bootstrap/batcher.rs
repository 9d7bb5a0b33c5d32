//! Packing source material into model-sized batches.

use serde::{Deserialize, Serialize};

/// Output tokens requested for a batch holding a single chunk.
pub const BASE_OUTPUT_TOKENS: u32 = 4_096;
/// Additional output tokens for every chunk beyond the first.
pub const OUTPUT_TOKENS_PER_EXTRA_CHUNK: u32 = 1_024;
/// Hard ceiling on requested output tokens.
pub const MAX_OUTPUT_TOKENS: u32 = 16_384;

/// A piece of source material small enough for one model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChunk {
    /// Where the text came from (file name, conversation id).
    pub source: String,
    pub text: String,
}

impl SourceChunk {
    #[must_use]
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }

    /// Size in characters, the unit of the batch budget.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Greedy, order-preserving bin packing of chunks into batches.
///
/// A chunk larger than the budget gets a batch of its own; it is never split
/// or dropped. A budget of zero disables batching.
///
/// # Examples
///
/// ```
/// use kyrograph::bootstrap::{pack, SourceChunk};
///
/// let chunks = vec![
///     SourceChunk::new("a", "12345"),
///     SourceChunk::new("b", "12345"),
///     SourceChunk::new("c", "12345"),
/// ];
/// let batches = pack(&chunks, 10);
/// assert_eq!(batches.len(), 2);
/// assert_eq!(batches[0].len(), 2);
/// ```
#[must_use]
pub fn pack(chunks: &[SourceChunk], char_budget: usize) -> Vec<Vec<SourceChunk>> {
    if char_budget == 0 {
        return chunks.iter().map(|chunk| vec![chunk.clone()]).collect();
    }

    let mut batches = Vec::new();
    let mut current: Vec<SourceChunk> = Vec::new();
    let mut current_size = 0usize;
    for chunk in chunks {
        let len = chunk.char_len();
        if !current.is_empty() && current_size.saturating_add(len) > char_budget {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(chunk.clone());
        current_size = current_size.saturating_add(len);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Output token allowance for a batch of `chunk_count` chunks.
#[must_use]
pub fn max_output_tokens(chunk_count: usize) -> u32 {
    let extra = u32::try_from(chunk_count.saturating_sub(1)).unwrap_or(u32::MAX);
    BASE_OUTPUT_TOKENS
        .saturating_add(extra.saturating_mul(OUTPUT_TOKENS_PER_EXTRA_CHUNK))
        .min(MAX_OUTPUT_TOKENS)
}

/// Splits raw source text into chunks of at most `max_chars` characters.
///
/// Paragraphs (separated by blank lines) are kept whole where possible;
/// a paragraph longer than the limit is split on character boundaries.
#[must_use]
pub fn chunk_text(source: &str, text: &str, max_chars: usize) -> Vec<SourceChunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    for paragraph in paragraphs(text) {
        if paragraph.chars().count() <= max_chars {
            pieces.push(paragraph);
            continue;
        }
        let chars: Vec<char> = paragraph.chars().collect();
        pieces.extend(chars.chunks(max_chars).map(|part| part.iter().collect()));
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for piece in pieces {
        let len = piece.chars().count();
        let joined_len = if current.is_empty() { len } else { current_len + 2 + len };
        if !current.is_empty() && joined_len > max_chars {
            chunks.push(SourceChunk::new(source, std::mem::take(&mut current)));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(&piece);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(SourceChunk::new(source, current));
    }
    chunks
}

fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}
