//! Sentence-aware text chunking with cross-boundary overlap.
//!
//! [`chunk`] is a pure function: for a fixed `(text, options)` pair it always
//! produces the same ordered list of non-empty chunks, which keeps indexing
//! runs deterministic and re-runnable.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

/// Chunking parameters.
///
/// Sizes are measured in grapheme clusters so multi-byte text (CJK, emoji,
/// combining marks) is never split mid-character.
#[derive(Clone, Copy, Debug)]
pub struct ChunkOptions {
    /// Upper bound on chunk size. A chunk only exceeds this when a single
    /// sentence alone exceeds it, and then only via forced fixed-width
    /// splitting which re-imposes the bound per window.
    pub max_chars: usize,
    /// Tail of each emitted chunk carried into the next one.
    pub overlap_chars: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chars: 700,
            overlap_chars: 100,
        }
    }
}

/// Configuration error for [`ChunkOptions`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("max_chars must be non-zero")]
    ZeroMaxChars,
    #[error("overlap_chars ({overlap}) must be smaller than max_chars ({max})")]
    OverlapTooLarge { overlap: usize, max: usize },
}

impl ChunkOptions {
    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.max_chars == 0 {
            return Err(ChunkingError::ZeroMaxChars);
        }
        if self.overlap_chars >= self.max_chars {
            return Err(ChunkingError::OverlapTooLarge {
                overlap: self.overlap_chars,
                max: self.max_chars,
            });
        }
        Ok(())
    }
}

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Sentence-ending punctuation (ASCII and full-width) followed by
    // whitespace. The boundary match keeps the punctuation with the sentence.
    RE.get_or_init(|| Regex::new(r"[.!?。．！？]+\s+").expect("sentence boundary regex is valid"))
}

/// Splits `text` into bounded, overlapping chunks respecting sentence
/// boundaries.
///
/// - Trimmed-empty input yields no chunks.
/// - Input at or under `max_chars` yields the single trimmed string.
/// - Otherwise sentences are greedily packed; when the next sentence would
///   overflow, the buffer is emitted and the next buffer is seeded with the
///   emitted chunk's last `overlap_chars` characters.
/// - A single sentence longer than `max_chars` is force-split into
///   `max_chars`-wide windows, each window starting `overlap_chars` before
///   the previous window's end.
pub fn chunk(text: &str, options: &ChunkOptions) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let max = options.max_chars.max(1);
    // Clamped so forced splits always advance even on unvalidated options.
    let overlap = options.overlap_chars.min(max.saturating_sub(1));

    if grapheme_len(trimmed) <= max {
        return vec![trimmed.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut buffer = String::new();
    // True while the buffer holds only an overlap seed (or nothing): such a
    // buffer must not be emitted on its own.
    let mut seed_only = true;

    for sentence in split_sentences(trimmed) {
        if grapheme_len(&sentence) > max {
            if !seed_only {
                chunks.push(buffer.clone());
            }
            force_split_into(&sentence, max, overlap, &mut chunks);
            buffer = tail_graphemes(
                chunks.last().map(String::as_str).unwrap_or_default(),
                overlap,
            )
            .to_string();
            seed_only = true;
            continue;
        }

        let joined_len = if buffer.is_empty() {
            grapheme_len(&sentence)
        } else {
            grapheme_len(&buffer) + 1 + grapheme_len(&sentence)
        };

        if joined_len <= max {
            if !buffer.is_empty() {
                buffer.push(' ');
            }
            buffer.push_str(&sentence);
            seed_only = false;
            continue;
        }

        if seed_only {
            // The seed plus this sentence would overflow; the seed loses.
            buffer = sentence;
            seed_only = false;
            continue;
        }

        chunks.push(buffer.clone());
        let seed = tail_graphemes(&buffer, overlap);
        buffer = if grapheme_len(seed) + 1 + grapheme_len(&sentence) <= max {
            format!("{seed} {sentence}")
        } else {
            sentence
        };
        seed_only = false;
    }

    if !seed_only && !buffer.trim().is_empty() {
        chunks.push(buffer);
    }

    chunks
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for boundary in sentence_boundary().find_iter(text) {
        let sentence = text[last..boundary.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        last = boundary.end();
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn force_split_into(sentence: &str, max: usize, overlap: usize, chunks: &mut Vec<String>) {
    let offsets: Vec<usize> = sentence.grapheme_indices(true).map(|(i, _)| i).collect();
    let total = offsets.len();
    let byte_at = |g: usize| {
        if g >= total {
            sentence.len()
        } else {
            offsets[g]
        }
    };

    let mut start = 0usize;
    loop {
        let end = (start + max).min(total);
        chunks.push(sentence[byte_at(start)..byte_at(end)].to_string());
        if end == total {
            break;
        }
        start = end - overlap;
    }
}

fn grapheme_len(s: &str) -> usize {
    s.graphemes(true).count()
}

/// The last `n` grapheme clusters of `s`, or all of `s` when shorter.
fn tail_graphemes(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let offsets: Vec<usize> = s.grapheme_indices(true).map(|(i, _)| i).collect();
    if offsets.len() <= n {
        s
    } else {
        &s[offsets[offsets.len() - n]..]
    }
}
