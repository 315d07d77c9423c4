//! Query expansion: alternate phrasings of a user question to broaden recall
//! before vector search.
//!
//! Expansion is a pure quality enhancement. [`QueryExpander::expand`] never
//! fails: any trouble generating or gating alternates falls back to the
//! original query alone.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::providers::{EmbeddingProvider, GenerationRequest, TextGenerator};
use crate::types::cosine_similarity;

/// Tuning knobs for the expander.
#[derive(Clone, Copy, Debug)]
pub struct ExpanderOptions {
    /// Queries with fewer non-whitespace characters than this carry too
    /// little signal to rewrite.
    pub min_query_chars: usize,
    /// Accepted alternates are capped here; the original always rides along.
    pub max_alternates: usize,
    pub min_candidate_chars: usize,
    pub max_candidate_chars: usize,
    /// Candidates whose cosine similarity to the original falls below this
    /// are considered topic drift and dropped.
    pub similarity_floor: f32,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for ExpanderOptions {
    fn default() -> Self {
        Self {
            min_query_chars: 10,
            max_alternates: 2,
            min_candidate_chars: 4,
            max_candidate_chars: 200,
            similarity_floor: 0.3,
            temperature: 0.3,
            max_output_tokens: 256,
        }
    }
}

pub struct QueryExpander {
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: ExpanderOptions,
}

impl QueryExpander {
    pub fn new(generator: Arc<dyn TextGenerator>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_options(generator, embedder, ExpanderOptions::default())
    }

    pub fn with_options(
        generator: Arc<dyn TextGenerator>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: ExpanderOptions,
    ) -> Self {
        Self {
            generator,
            embedder,
            options,
        }
    }

    /// Returns the original query first, followed by 0 to
    /// `max_alternates` accepted rephrasings. Never fails.
    pub async fn expand(&self, query: &str) -> Vec<String> {
        let query = query.trim();
        let signal_chars = query.chars().filter(|c| !c.is_whitespace()).count();
        if signal_chars < self.options.min_query_chars {
            return vec![query.to_string()];
        }

        let request = GenerationRequest {
            prompt: self.build_prompt(query),
            temperature: self.options.temperature,
            max_output_tokens: self.options.max_output_tokens,
        };
        let raw = match self.generator.generate(&request).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "query expansion failed; using original query only");
                return vec![query.to_string()];
            }
        };

        let mut candidates = self.parse_candidates(&raw);
        candidates.retain(|candidate| candidate != query);
        let accepted = self.similarity_gate(query, candidates).await;

        let mut variants = vec![query.to_string()];
        variants.extend(accepted.into_iter().take(self.options.max_alternates));
        variants
    }

    fn build_prompt(&self, query: &str) -> String {
        format!(
            "You rewrite search queries for a help-desk knowledge base. \
             Produce up to {max} alternate phrasings of the question below that \
             preserve its intent while varying the terminology: expand or \
             contract abbreviations, substitute related concepts, and add a \
             translation when the question mixes languages. \
             Return one phrasing per line with no numbering or commentary.\n\n\
             Question: {query}",
            max = self.options.max_alternates,
        )
    }

    fn parse_candidates(&self, raw: &str) -> Vec<String> {
        raw.lines()
            .map(|line| strip_list_marker(line).trim().to_string())
            .filter(|line| {
                let len = line.chars().count();
                len >= self.options.min_candidate_chars && len <= self.options.max_candidate_chars
            })
            .collect()
    }

    /// Drops candidates that drifted off-topic. Fail-open: if the gate
    /// itself cannot run, every candidate is kept.
    async fn similarity_gate(&self, query: &str, candidates: Vec<String>) -> Vec<String> {
        if candidates.is_empty() {
            return candidates;
        }
        let origin = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "similarity gate unavailable; keeping all candidates");
                return candidates;
            }
        };

        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.embedder.embed(&candidate).await {
                Ok(vector) => {
                    let score = cosine_similarity(&origin, &vector);
                    if score >= self.options.similarity_floor {
                        kept.push(candidate);
                    } else {
                        debug!(candidate = %candidate, score, "dropped off-topic expansion candidate");
                    }
                }
                Err(err) => {
                    warn!(candidate = %candidate, error = %err, "candidate embedding failed; keeping it");
                    kept.push(candidate);
                }
            }
        }
        kept
    }
}

fn strip_list_marker(line: &str) -> &str {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*•]+|\d+[.)])\s*").expect("list marker regex is valid")
    });
    match re.find(line) {
        Some(marker) => &line[marker.end()..],
        None => line,
    }
}
