//! Heuristic text similarity used by both dedup passes.
//!
//! The combined score blends character-trigram Jaccard (near-exact
//! phrasing) with word-set Jaccard (paraphrase on the same topic), weighted
//! toward the word set. Every score is symmetric and lies in `[0, 1]`.

use std::collections::HashSet;
use std::hash::Hash;

/// Weight of the trigram component in [`similarity`].
pub const TRIGRAM_WEIGHT: f64 = 0.4;

/// Weight of the token component in [`similarity`].
pub const TOKEN_WEIGHT: f64 = 0.6;

/// Lowercased word set. Splits on anything that is not a letter or digit,
/// so accented and non-Latin letters stay inside their words.
#[must_use]
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Character trigrams over the lowercased, whitespace-collapsed text.
///
/// Text shorter than three characters yields itself as its only gram.
#[must_use]
pub fn trigrams(text: &str) -> HashSet<String> {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() < 3 {
        return if chars.is_empty() {
            HashSet::new()
        } else {
            HashSet::from([normalized])
        };
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// Jaccard index; two empty sets are identical.
fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    if intersection == 0 {
        return 0.0;
    }
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

#[must_use]
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    jaccard(&trigrams(a), &trigrams(b))
}

#[must_use]
pub fn token_similarity(a: &str, b: &str) -> f64 {
    jaccard(&tokenize(a), &tokenize(b))
}

/// Combined similarity of two texts.
///
/// # Examples
///
/// ```
/// use kyrograph::dedup::similarity;
///
/// let score = similarity("user prefers dark mode", "user prefers dark theme");
/// assert!(score > 0.5 && score < 1.0);
/// assert_eq!(similarity("same", "same"), 1.0);
/// ```
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    TextProfile::new(a).score(&TextProfile::new(b))
}

/// Precomputed token and trigram sets for repeated scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextProfile {
    tokens: HashSet<String>,
    trigrams: HashSet<String>,
}

impl TextProfile {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            tokens: tokenize(text),
            trigrams: trigrams(text),
        }
    }

    /// Combined similarity against `other`.
    #[must_use]
    pub fn score(&self, other: &Self) -> f64 {
        let combined = TRIGRAM_WEIGHT * jaccard(&self.trigrams, &other.trigrams)
            + TOKEN_WEIGHT * jaccard(&self.tokens, &other.tokens);
        combined.clamp(0.0, 1.0)
    }
}
