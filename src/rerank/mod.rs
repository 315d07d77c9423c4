//! Second-pass relevance scoring of retrieved candidates.
//!
//! Reranking is a pure quality enhancement with a hard latency budget: the
//! scoring call races a timer, parsing has a lenient fallback tier, and any
//! failure whatsoever returns the candidates in their original order.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::providers::{GenerationRequest, TextGenerator};
use crate::types::RetrievedChunk;

/// Candidate sets at or under this size keep their retrieval order; the
/// scoring round-trip is not worth the latency.
const SKIP_THRESHOLD: usize = 3;

/// Score substituted for any missing or unparseable entry.
const NEUTRAL_SCORE: f32 = 0.5;

#[derive(Clone, Copy, Debug)]
pub struct RerankOptions {
    /// The scoring call is abandoned (its late result discarded) once this
    /// much time has passed.
    pub timeout: Duration,
    /// How much of each chunk is quoted into the scoring prompt.
    pub preview_chars: usize,
    pub max_output_tokens: u32,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            preview_chars: 200,
            max_output_tokens: 512,
        }
    }
}

pub struct Reranker {
    generator: Arc<dyn TextGenerator>,
    options: RerankOptions,
}

impl Reranker {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_options(generator, RerankOptions::default())
    }

    pub fn with_options(generator: Arc<dyn TextGenerator>, options: RerankOptions) -> Self {
        Self { generator, options }
    }

    /// Reorders `chunks` by remote relevance score, descending and stable.
    /// On trivial input, scoring failure, or timeout the original order is
    /// returned unchanged.
    pub async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        if chunks.len() <= SKIP_THRESHOLD {
            return chunks;
        }

        let request = GenerationRequest {
            prompt: self.build_prompt(query, &chunks),
            // Deterministic scoring.
            temperature: 0.0,
            max_output_tokens: self.options.max_output_tokens,
        };

        let raw = match tokio::time::timeout(self.options.timeout, self.generator.generate(&request))
            .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                warn!(error = %err, "rerank scoring call failed; keeping retrieval order");
                return chunks;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.options.timeout.as_millis() as u64,
                    "rerank scoring timed out; keeping retrieval order"
                );
                return chunks;
            }
        };

        let scores = parse_scores(&raw, chunks.len());
        let mut scored: Vec<RetrievedChunk> = chunks
            .into_iter()
            .zip(scores)
            .map(|(mut chunk, score)| {
                chunk.rerank_score = Some(score);
                chunk
            })
            .collect();
        // sort_by is stable: ties keep their relative retrieval order.
        scored.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(Ordering::Equal)
        });
        scored
    }

    fn build_prompt(&self, query: &str, chunks: &[RetrievedChunk]) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You score passages for relevance to a help-desk question. Respond \
             with only a JSON array of numbers between 0 and 1, one per passage, \
             in the same order as the passages.\n\n",
        );
        prompt.push_str(&format!("Question: {query}\n\nPassages:\n"));
        for (index, item) in chunks.iter().enumerate() {
            let preview: String = item
                .chunk
                .content
                .chars()
                .take(self.options.preview_chars)
                .collect();
            prompt.push_str(&format!("[{index}] {preview}\n"));
        }
        prompt
    }
}

/// Extracts exactly `expected` scores from a scoring response, clamped into
/// `[0, 1]`.
///
/// Tier one parses the first JSON array in the text; tier two scrapes bare
/// numeric substrings. Whatever is still missing defaults to the neutral
/// score rather than failing the rerank.
fn parse_scores(raw: &str, expected: usize) -> Vec<f32> {
    let mut scores = extract_json_scores(raw).unwrap_or_default();
    if scores.len() < expected {
        scores = extract_numeric_scores(raw);
    }
    scores.resize(expected, NEUTRAL_SCORE);
    scores
        .into_iter()
        .map(|score| if score.is_finite() { score.clamp(0.0, 1.0) } else { NEUTRAL_SCORE })
        .collect()
}

fn extract_json_scores(raw: &str) -> Option<Vec<f32>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<f32>>(&raw[start..=end]).ok()
}

fn extract_numeric_scores(raw: &str) -> Vec<f32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number regex is valid"));
    re.find_iter(raw)
        .filter_map(|m| m.as_str().parse::<f32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockGenerator, MockReply};
    use crate::stores::{ChunkRecord, SourceCategory};

    fn candidate(id: &str, content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: ChunkRecord::new(
                id,
                "Refund policy",
                SourceCategory::Document,
                0,
                1,
                content,
                "mock-embedding",
            ),
            similarity: 0.9,
            rerank_score: None,
        }
    }

    fn candidates(n: usize) -> Vec<RetrievedChunk> {
        (0..n)
            .map(|i| candidate(&format!("c{i}"), &format!("passage number {i}")))
            .collect()
    }

    fn ids(chunks: &[RetrievedChunk]) -> Vec<String> {
        chunks.iter().map(|c| c.chunk.id.clone()).collect()
    }

    #[tokio::test]
    async fn small_candidate_sets_skip_reranking() {
        let reranker = Reranker::new(Arc::new(MockGenerator::failing()));
        let input = candidates(3);
        let expected = ids(&input);
        let output = reranker.rerank("question", input).await;
        assert_eq!(ids(&output), expected, "order must be untouched");
        assert!(output.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn scores_reorder_candidates_descending() {
        let generator = MockGenerator::always("[0.1, 0.9, 0.4, 0.8]");
        let reranker = Reranker::new(Arc::new(generator));
        let output = reranker.rerank("question", candidates(4)).await;
        assert_eq!(ids(&output), vec!["c1", "c3", "c2", "c0"]);
        assert_eq!(output[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn failure_returns_original_order() {
        let reranker = Reranker::new(Arc::new(MockGenerator::failing()));
        let input = candidates(5);
        let expected = ids(&input);
        let output = reranker.rerank("question", input).await;
        assert_eq!(ids(&output), expected);
    }

    #[tokio::test]
    async fn timeout_returns_original_order() {
        let generator = MockGenerator::with_script(vec![MockReply::DelayedText(
            Duration::from_secs(5),
            "[1, 1, 1, 1]".to_string(),
        )]);
        let reranker = Reranker::with_options(
            Arc::new(generator),
            RerankOptions {
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let input = candidates(4);
        let expected = ids(&input);
        let output = reranker.rerank("question", input).await;
        assert_eq!(ids(&output), expected, "late result must be discarded");
        assert!(output.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn prose_wrapped_json_still_parses() {
        let generator =
            MockGenerator::always("Here are the scores: [0.2, 0.3, 0.9, 0.1] as requested.");
        let reranker = Reranker::new(Arc::new(generator));
        let output = reranker.rerank("question", candidates(4)).await;
        assert_eq!(ids(&output)[0], "c2");
    }

    #[tokio::test]
    async fn numeric_fallback_when_json_is_malformed() {
        let generator = MockGenerator::always("scores: 0.2 then 0.7 then 0.5 then 0.6");
        let reranker = Reranker::new(Arc::new(generator));
        let output = reranker.rerank("question", candidates(4)).await;
        assert_eq!(ids(&output), vec!["c1", "c3", "c2", "c0"]);
    }

    #[tokio::test]
    async fn missing_scores_default_to_neutral() {
        let generator = MockGenerator::always("[0.9, 0.1]");
        let reranker = Reranker::new(Arc::new(generator));
        let output = reranker.rerank("question", candidates(4)).await;
        // c0 keeps 0.9, c1 gets 0.1, c2/c3 pad at 0.5 and stay in order.
        assert_eq!(ids(&output), vec!["c0", "c2", "c3", "c1"]);
        assert_eq!(output[1].rerank_score, Some(NEUTRAL_SCORE));
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped() {
        let generator = MockGenerator::always("[4.0, -2.0, 0.5, 0.6]");
        let reranker = Reranker::new(Arc::new(generator));
        let output = reranker.rerank("question", candidates(4)).await;
        assert_eq!(output[0].rerank_score, Some(1.0));
        assert_eq!(output[3].rerank_score, Some(0.0));
    }

    #[test]
    fn parse_scores_handles_garbage() {
        assert_eq!(parse_scores("no numbers at all", 3), vec![0.5, 0.5, 0.5]);
        assert_eq!(parse_scores("[0.25]", 2), vec![0.25, 0.5]);
        // An overlong array is truncated to the candidate count.
        assert_eq!(parse_scores("[0.1, 0.2, 0.3]", 2), vec![0.1, 0.2]);
    }
}
