// ── factgraph Atoms: Recall Types & Configuration ─────────────────────────
//
// Search options, ranked/hydrated results, and the serde configuration tree
// for the recall core. Every config struct has a `Default` mirroring
// `atoms::constants`, and `#[serde(default)]` so partial JSON works.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::MemoryState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Search Options
// ═══════════════════════════════════════════════════════════════════════════

/// Which retrieval arms to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Text,
    Vector,
}

/// Post-hydration reranking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    #[default]
    None,
    CrossEncoder,
    Mmr,
}

impl std::fmt::Display for RerankMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerankMode::None => write!(f, "none"),
            RerankMode::CrossEncoder => write!(f, "cross_encoder"),
            RerankMode::Mmr => write!(f, "mmr"),
        }
    }
}

impl std::str::FromStr for RerankMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(RerankMode::None),
            "cross_encoder" => Ok(RerankMode::CrossEncoder),
            "mmr" => Ok(RerankMode::Mmr),
            other => Err(EngineError::Invalid(format!("unknown rerank mode '{other}'"))),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hybrid" | "" => Ok(SearchMode::Hybrid),
            "text" => Ok(SearchMode::Text),
            "vector" => Ok(SearchMode::Vector),
            other => Err(EngineError::Invalid(format!("unknown search mode '{other}'"))),
        }
    }
}

/// Per-call search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub user_id: String,
    pub top_k: usize,
    pub mode: SearchMode,
    /// Per-arm cap before fusion.
    pub candidate_size: usize,
    pub rerank: RerankMode,
    /// Final size after reranking. Defaults to `top_k`.
    pub rerank_top_n: Option<usize>,
}

impl SearchOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            top_k: DEFAULT_TOP_K,
            mode: SearchMode::Hybrid,
            candidate_size: DEFAULT_CANDIDATE_SIZE,
            rerank: RerankMode::None,
            rerank_top_n: None,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn candidate_size(mut self, size: usize) -> Self {
        self.candidate_size = size;
        self
    }

    pub fn rerank(mut self, rerank: RerankMode, top_n: Option<usize>) -> Self {
        self.rerank = rerank;
        self.rerank_top_n = top_n;
        self
    }

    pub fn effective_rerank_top_n(&self) -> usize {
        self.rerank_top_n.unwrap_or(self.top_k)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Ranked & Hydrated Results
// ═══════════════════════════════════════════════════════════════════════════

/// One fused candidate. Ranks are 1-based; `None` when the arm missed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub id: String,
    pub text_rank: Option<usize>,
    pub vector_rank: Option<usize>,
    pub score: f64,
}

impl RankedCandidate {
    pub fn in_both_arms(&self) -> bool {
        self.text_rank.is_some() && self.vector_rank.is_some()
    }

    /// Best (lowest) rank across arms.
    pub fn best_rank(&self) -> usize {
        match (self.text_rank, self.vector_rank) {
            (Some(t), Some(v)) => t.min(v),
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => usize::MAX,
        }
    }
}

/// A memory row joined with its categories, tags and source app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMemory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub valid_at: DateTime<Utc>,
    pub state: MemoryState,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub app_name: Option<String>,
}

/// A search hit: hydrated content plus how it was ranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: HydratedMemory,
    pub ranking: RankedCandidate,
    /// Cross-encoder score (0–10) or MMR score, when a reranker ran.
    pub rerank_score: Option<f64>,
}

impl SearchResult {
    pub fn id(&self) -> &str {
        &self.memory.id
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: LLM Chat Contract
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

/// A single non-streaming chat-completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Configuration
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub top_k: usize,
    pub candidate_size: usize,
    pub rrf_k: f64,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self { top_k: DEFAULT_TOP_K, candidate_size: DEFAULT_CANDIDATE_SIZE, rrf_k: RRF_K }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// Model used for cross-encoder scoring. Empty = `LlmConfig::model`.
    pub model: String,
    pub concurrency: usize,
    pub mmr_lambda: f64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            concurrency: CROSS_ENCODER_CONCURRENCY,
            mmr_lambda: DEFAULT_MMR_LAMBDA,
            temperature: 0.0,
            max_tokens: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub fuzzy_threshold: f64,
    pub fuzzy_min_name_len: usize,
    pub semantic_match_threshold: f64,
    pub semantic_judge_floor: f64,
    /// Ask the LLM when semantic similarity is ambiguous.
    pub llm_judge: bool,
    /// Model for the judge. Empty = `LlmConfig::model`.
    pub judge_model: String,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: FUZZY_NAME_THRESHOLD,
            fuzzy_min_name_len: FUZZY_MIN_NAME_LEN,
            semantic_match_threshold: SEMANTIC_MATCH_THRESHOLD,
            semantic_judge_floor: SEMANTIC_JUDGE_FLOOR,
            llm_judge: true,
            judge_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Model for entity extraction. Empty = `LlmConfig::model`.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Parallel candidate resolutions within one memory.
    pub concurrency: usize,
    /// Queue retry policy.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.0,
            max_tokens: 1500,
            concurrency: EXTRACTION_CONCURRENCY,
            max_attempts: EXTRACTION_MAX_ATTEMPTS,
            retry_base_ms: EXTRACTION_RETRY_BASE_MS,
        }
    }
}

/// OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            timeout_secs: 60,
        }
    }
}

/// Ollama or OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            api_key: String::new(),
            dims: 768,
        }
    }
}

/// Root configuration for the recall core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecallConfig {
    pub search: SearchDefaults,
    pub rerank: RerankConfig,
    pub resolution: ResolutionConfig,
    pub extraction: ExtractionConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
}

impl RecallConfig {
    /// Parse and validate a JSON config blob. Missing fields take defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: RecallConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(EngineError::Config(format!("{name} must be within 0.0–1.0, got {v}")))
            }
        };
        unit("rerank.mmr_lambda", self.rerank.mmr_lambda)?;
        unit("resolution.fuzzy_threshold", self.resolution.fuzzy_threshold)?;
        unit("resolution.semantic_match_threshold", self.resolution.semantic_match_threshold)?;
        unit("resolution.semantic_judge_floor", self.resolution.semantic_judge_floor)?;
        if self.resolution.semantic_judge_floor > self.resolution.semantic_match_threshold {
            return Err(EngineError::Config(
                "resolution.semantic_judge_floor exceeds semantic_match_threshold".into(),
            ));
        }
        if self.search.rrf_k <= 0.0 {
            return Err(EngineError::Config("search.rrf_k must be positive".into()));
        }
        if self.rerank.concurrency == 0 || self.extraction.concurrency == 0 {
            return Err(EngineError::Config("concurrency must be at least 1".into()));
        }
        if self.extraction.max_attempts == 0 {
            return Err(EngineError::Config("extraction.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Model for cross-encoder scoring.
    pub fn rerank_model(&self) -> &str {
        non_empty_or(&self.rerank.model, &self.llm.model)
    }

    /// Model for entity extraction.
    pub fn extraction_model(&self) -> &str {
        non_empty_or(&self.extraction.model, &self.llm.model)
    }

    /// Model for tier-3 same-entity judgments.
    pub fn judge_model(&self) -> &str {
        non_empty_or(&self.resolution.judge_model, &self.llm.model)
    }
}

fn non_empty_or<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg = RecallConfig::from_json(r#"{"rerank":{"mmr_lambda":0.5}}"#).unwrap();
        assert!((cfg.rerank.mmr_lambda - 0.5).abs() < 1e-9);
        assert_eq!(cfg.rerank.concurrency, CROSS_ENCODER_CONCURRENCY);
        assert_eq!(cfg.search.top_k, DEFAULT_TOP_K);
    }

    #[test]
    fn test_invalid_lambda_rejected() {
        let err = RecallConfig::from_json(r#"{"rerank":{"mmr_lambda":1.5}}"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_model_fallbacks() {
        let mut cfg = RecallConfig::default();
        assert_eq!(cfg.rerank_model(), cfg.llm.model);
        cfg.extraction.model = "extractor".into();
        assert_eq!(cfg.extraction_model(), "extractor");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("cross_encoder".parse::<RerankMode>().unwrap(), RerankMode::CrossEncoder);
        assert_eq!("vector".parse::<SearchMode>().unwrap(), SearchMode::Vector);
        assert!("bogus".parse::<RerankMode>().is_err());
    }

    #[test]
    fn test_rerank_top_n_defaults_to_top_k() {
        let opts = SearchOptions::new("u1").top_k(7);
        assert_eq!(opts.effective_rerank_top_n(), 7);
        let opts = opts.rerank(RerankMode::Mmr, Some(3));
        assert_eq!(opts.effective_rerank_top_n(), 3);
    }

    #[test]
    fn test_best_rank() {
        let c = RankedCandidate { id: "a".into(), text_rank: Some(4), vector_rank: Some(2), score: 0.0 };
        assert_eq!(c.best_rank(), 2);
        assert!(c.in_both_arms());
    }
}
