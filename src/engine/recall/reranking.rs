// ── Recall: Reranking ───────────────────────────────────────────────────────
//
// Two strategies applied after fusion + hydration:
//
//   1. CrossEncoder: one LLM scoring call per (query, candidate) pair,
//      fanned out under a ConcurrencyLimiter. Scores are integers 0–10.
//   2. MMR: Maximal Marginal Relevance, greedy and purely local.
//
// Both consume `SearchResult`s in fused order and return at most `top_n`.

use crate::atoms::constants::{CROSS_ENCODER_MAX_SCORE, DEFAULT_MMR_LAMBDA};
use crate::atoms::recall_types::{ChatMessage, ChatRequest, RecallConfig, SearchResult};
use crate::atoms::traits::LlmClient;
use crate::engine::limiter::ConcurrencyLimiter;
use futures::future::join_all;
use log::{info, warn};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

static FIRST_INTEGER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"-?\d+").ok());

const CROSS_ENCODER_SYSTEM_PROMPT: &str = "You are a relevance judge. Given a search query and a \
stored memory, rate how relevant the memory is to the query on a scale from 0 (irrelevant) to 10 \
(directly answers it). Reply with a single integer and nothing else.";

/// Parse a relevance score from model output: the first integer found,
/// clamped to 0–10. Anything without a number scores 0.
pub fn parse_relevance_score(raw: &str) -> f64 {
    let Some(re) = FIRST_INTEGER.as_ref() else {
        return 0.0;
    };
    re.find(raw)
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .map(|n| n.clamp(0, CROSS_ENCODER_MAX_SCORE) as f64)
        .unwrap_or(0.0)
}

// ═══════════════════════════════════════════════════════════════════════════
// Strategy: Cross-Encoder
// ═══════════════════════════════════════════════════════════════════════════

pub struct CrossEncoderReranker {
    llm: Arc<dyn LlmClient>,
    limiter: ConcurrencyLimiter,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl CrossEncoderReranker {
    pub fn new(llm: Arc<dyn LlmClient>, config: &RecallConfig) -> Self {
        Self {
            llm,
            limiter: ConcurrencyLimiter::new(config.rerank.concurrency),
            model: config.rerank_model().to_string(),
            temperature: config.rerank.temperature,
            max_tokens: config.rerank.max_tokens,
        }
    }

    /// Share an existing limiter with other LLM callers.
    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Score one candidate. Never fails: errors score 0.
    pub async fn score(&self, query: &str, content: &str) -> f64 {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(CROSS_ENCODER_SYSTEM_PROMPT),
                ChatMessage::user(format!("Query: {query}\n\nMemory: {content}\n\nScore:")),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        match self.limiter.run(|| self.llm.chat(request)).await {
            Ok(text) => parse_relevance_score(&text),
            Err(e) => {
                warn!("[recall] Cross-encoder scoring failed, using 0: {}", e);
                0.0
            }
        }
    }

    /// Score every candidate concurrently, sort descending (stable, so ties
    /// keep fused order) and keep `top_n`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        top_n: usize,
    ) -> Vec<SearchResult> {
        if candidates.is_empty() || top_n == 0 {
            return Vec::new();
        }

        let scores =
            join_all(candidates.iter().map(|c| self.score(query, &c.memory.content))).await;

        let mut scored: Vec<SearchResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(mut c, s)| {
                c.rerank_score = Some(s);
                c
            })
            .collect();

        scored.sort_by(|a, b| {
            let sa = a.rerank_score.unwrap_or(0.0);
            let sb = b.rerank_score.unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
        });
        scored.truncate(top_n);

        info!("[recall] Cross-encoder reranked to {} results", scored.len());
        scored
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Strategy: MMR (Maximal Marginal Relevance)
// ═══════════════════════════════════════════════════════════════════════════

/// λ=1.0 is pure relevance, λ=0.0 is pure diversity.
#[derive(Debug, Clone, Copy)]
pub struct MmrReranker {
    lambda: f64,
}

impl Default for MmrReranker {
    fn default() -> Self {
        Self { lambda: DEFAULT_MMR_LAMBDA }
    }
}

impl MmrReranker {
    pub fn new(lambda: f64) -> Self {
        Self { lambda: lambda.clamp(0.0, 1.0) }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Greedy MMR selection of up to `top_n` candidates.
    ///
    /// Relevance is the fused score normalized by the best fused score.
    /// The first pick is the most relevant; each later pick maximizes
    /// `λ·relevance − (1−λ)·max_sim_to_selected`. Ties go to the earlier candidate.
    pub fn rerank(&self, candidates: Vec<SearchResult>, top_n: usize) -> Vec<SearchResult> {
        let n = candidates.len();
        if n == 0 || top_n == 0 {
            return Vec::new();
        }

        let max_score = candidates
            .iter()
            .map(|c| c.ranking.score)
            .fold(0.0_f64, f64::max);
        let relevance: Vec<f64> = candidates
            .iter()
            .map(|c| if max_score > 0.0 { c.ranking.score / max_score } else { 0.0 })
            .collect();

        let similarities = compute_pairwise_similarities(&candidates);

        let mut selected: Vec<(usize, f64)> = Vec::with_capacity(top_n.min(n));
        let mut remaining: Vec<usize> = (0..n).collect();

        while selected.len() < top_n && !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_score = f64::NEG_INFINITY;
            for (pos, &idx) in remaining.iter().enumerate() {
                let max_sim = selected
                    .iter()
                    .map(|&(s, _)| similarities[idx][s])
                    .fold(0.0_f64, f64::max);
                let score = self.lambda * relevance[idx] - (1.0 - self.lambda) * max_sim;
                // Strict comparison keeps the earlier candidate on ties.
                if score > best_score {
                    best_score = score;
                    best_pos = pos;
                }
            }
            let idx = remaining.remove(best_pos);
            selected.push((idx, best_score));
        }

        let mut slots: Vec<Option<SearchResult>> = candidates.into_iter().map(Some).collect();
        selected
            .into_iter()
            .filter_map(|(idx, score)| {
                slots[idx].take().map(|mut c| {
                    c.rerank_score = Some(score);
                    c
                })
            })
            .collect()
    }
}

/// Lowercased word tokens, punctuation stripped.
fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Word-level Jaccard similarity. Two empty texts are treated as unrelated.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    jaccard(&word_set(a), &word_set(b))
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Symmetric n×n Jaccard matrix over candidate contents.
fn compute_pairwise_similarities(candidates: &[SearchResult]) -> Vec<Vec<f64>> {
    let n = candidates.len();
    let word_sets: Vec<HashSet<String>> =
        candidates.iter().map(|c| word_set(&c.memory.content)).collect();

    let mut sims = vec![vec![0.0_f64; n]; n];
    for i in 0..n {
        sims[i][i] = 1.0;
        for j in (i + 1)..n {
            let sim = jaccard(&word_sets[i], &word_sets[j]);
            sims[i][j] = sim;
            sims[j][i] = sim;
        }
    }
    sims
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
