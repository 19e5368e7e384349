// ── Recall: Hybrid Search Orchestrator ──────────────────────────────────────
//
// Pipeline per query:
//
//   1. Run the requested arms concurrently (text = BM25, vector = embed + cosine),
//      each capped at `candidate_size`.
//   2. Degrade to the surviving arm if one fails in hybrid mode.
//   3. Fuse with RRF to `top_k` (single-arm modes pass through).
//   4. Hydrate every fused id in ONE store call; drop ids with no live row.
//   5. Optionally rerank (cross-encoder or MMR) down to `rerank_top_n`.
//
// Hydration failure is fatal. Everything that only reduces richness (one arm,
// the reranker) degrades with a warning.

use crate::atoms::error::EngineResult;
use crate::atoms::recall_types::{
    RankedCandidate, RecallConfig, RerankMode, SearchMode, SearchOptions, SearchResult,
};
use crate::atoms::traits::{Embedder, LlmClient, SearchBackend};
use crate::engine::recall::fusion::{reciprocal_rank_fusion, single_arm, SearchArm};
use crate::engine::recall::reranking::{CrossEncoderReranker, MmrReranker};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

pub struct HybridSearch {
    backend: Arc<dyn SearchBackend>,
    embedder: Arc<dyn Embedder>,
    cross_encoder: Option<CrossEncoderReranker>,
    mmr: MmrReranker,
    rrf_k: f64,
}

impl HybridSearch {
    pub fn new(backend: Arc<dyn SearchBackend>, embedder: Arc<dyn Embedder>, config: &RecallConfig) -> Self {
        Self {
            backend,
            embedder,
            cross_encoder: None,
            mmr: MmrReranker::new(config.rerank.mmr_lambda),
            rrf_k: config.search.rrf_k,
        }
    }

    /// Enable cross-encoder reranking through `llm`.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, config: &RecallConfig) -> Self {
        self.cross_encoder = Some(CrossEncoderReranker::new(llm, config));
        self
    }

    /// Use a preconfigured cross-encoder (e.g. one sharing a limiter).
    pub fn with_cross_encoder(mut self, reranker: CrossEncoderReranker) -> Self {
        self.cross_encoder = Some(reranker);
        self
    }

    async fn text_arm(&self, query: &str, opts: &SearchOptions, cap: usize) -> EngineResult<Vec<String>> {
        self.backend.text_search(&opts.user_id, query, cap).await
    }

    async fn vector_arm(&self, query: &str, opts: &SearchOptions, cap: usize) -> EngineResult<Vec<String>> {
        let embedding = self.embedder.embed(query).await?;
        self.backend.vector_search(&opts.user_id, &embedding, cap).await
    }

    /// Steps 1–3: ranked, fused candidate ids.
    async fn rank(&self, query: &str, opts: &SearchOptions) -> EngineResult<Vec<RankedCandidate>> {
        let cap = opts.candidate_size;
        let k = self.rrf_k;

        match opts.mode {
            SearchMode::Text => {
                let ids = self.text_arm(query, opts, cap).await?;
                Ok(single_arm(&ids, SearchArm::Text, k, opts.top_k))
            }
            SearchMode::Vector => {
                let ids = self.vector_arm(query, opts, cap).await?;
                Ok(single_arm(&ids, SearchArm::Vector, k, opts.top_k))
            }
            SearchMode::Hybrid => {
                let (text, vector) =
                    tokio::join!(self.text_arm(query, opts, cap), self.vector_arm(query, opts, cap));
                match (text, vector) {
                    (Ok(t), Ok(v)) => {
                        debug!("[recall] Arms returned {} text + {} vector candidates", t.len(), v.len());
                        Ok(reciprocal_rank_fusion(&t, &v, k, opts.top_k))
                    }
                    (Err(e), Ok(v)) => {
                        warn!("[recall] Text arm unavailable, continuing vector-only: {}", e);
                        Ok(single_arm(&v, SearchArm::Vector, k, opts.top_k))
                    }
                    (Ok(t), Err(e)) => {
                        warn!("[recall] Vector arm unavailable, continuing text-only: {}", e);
                        Ok(single_arm(&t, SearchArm::Text, k, opts.top_k))
                    }
                    (Err(te), Err(ve)) => {
                        warn!("[recall] Both search arms failed; text arm: {}", te);
                        Err(ve)
                    }
                }
            }
        }
    }

    /// Run the full pipeline. An empty query or `top_k == 0` returns nothing
    /// without touching the store.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> EngineResult<Vec<SearchResult>> {
        if query.trim().is_empty() || opts.top_k == 0 {
            return Ok(Vec::new());
        }

        let ranked = self.rank(query, opts).await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = ranked.iter().map(|c| c.id.clone()).collect();
        let rows = self.backend.hydrate(&opts.user_id, &ids).await?;
        let mut by_id: HashMap<String, _> = rows.into_iter().map(|m| (m.id.clone(), m)).collect();

        let hydrated: Vec<SearchResult> = ranked
            .into_iter()
            .filter_map(|ranking| {
                by_id.remove(&ranking.id).map(|memory| SearchResult { memory, ranking, rerank_score: None })
            })
            .collect();
        let dropped = ids.len() - hydrated.len();
        if dropped > 0 {
            debug!("[recall] {} ranked ids had no live row at hydration", dropped);
        }

        let results = self.rerank(query, opts, hydrated).await;
        info!(
            "[recall] {:?} search for user {} → {} results (rerank={})",
            opts.mode,
            opts.user_id,
            results.len(),
            opts.rerank
        );
        Ok(results)
    }

    async fn rerank(&self, query: &str, opts: &SearchOptions, mut hydrated: Vec<SearchResult>) -> Vec<SearchResult> {
        let top_n = opts.effective_rerank_top_n();
        match opts.rerank {
            RerankMode::None => {
                hydrated.truncate(opts.top_k);
                hydrated
            }
            RerankMode::Mmr => self.mmr.rerank(hydrated, top_n),
            RerankMode::CrossEncoder => match &self.cross_encoder {
                Some(reranker) => reranker.rerank(query, hydrated, top_n).await,
                None => {
                    warn!("[recall] Cross-encoder requested but no LLM configured, keeping fused order");
                    hydrated.truncate(top_n);
                    hydrated
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;
    use crate::atoms::recall_types::{ChatRequest, HydratedMemory};
    use crate::atoms::types::MemoryState;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        text: Result<Vec<&'static str>, &'static str>,
        vector: Result<Vec<&'static str>, &'static str>,
        /// Ids with a live row; everything else is dropped at hydration.
        live: HashSet<&'static str>,
        hydrate_calls: AtomicUsize,
        arm_calls: AtomicUsize,
        /// `limit` each arm call received.
        arm_limits: parking_lot::Mutex<Vec<usize>>,
    }

    impl MockBackend {
        fn new(text: Vec<&'static str>, vector: Vec<&'static str>) -> Self {
            let live = text.iter().chain(vector.iter()).copied().collect();
            Self {
                text: Ok(text),
                vector: Ok(vector),
                live,
                hydrate_calls: AtomicUsize::new(0),
                arm_calls: AtomicUsize::new(0),
                arm_limits: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    fn arm(result: &Result<Vec<&'static str>, &'static str>, limit: usize) -> EngineResult<Vec<String>> {
        match result {
            Ok(ids) => Ok(ids.iter().take(limit).map(|s| s.to_string()).collect()),
            Err(msg) => Err(EngineError::Unsupported(msg.to_string())),
        }
    }

    #[async_trait]
    impl SearchBackend for MockBackend {
        async fn text_search(&self, _user_id: &str, _query: &str, limit: usize) -> EngineResult<Vec<String>> {
            self.arm_calls.fetch_add(1, Ordering::SeqCst);
            self.arm_limits.lock().push(limit);
            arm(&self.text, limit)
        }

        async fn vector_search(&self, _user_id: &str, _embedding: &[f32], limit: usize) -> EngineResult<Vec<String>> {
            self.arm_calls.fetch_add(1, Ordering::SeqCst);
            self.arm_limits.lock().push(limit);
            arm(&self.vector, limit)
        }

        async fn hydrate(&self, user_id: &str, ids: &[String]) -> EngineResult<Vec<HydratedMemory>> {
            self.hydrate_calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            // Reverse to prove the orchestrator restores fused order.
            Ok(ids
                .iter()
                .rev()
                .filter(|id| self.live.contains(id.as_str()))
                .map(|id| HydratedMemory {
                    id: id.clone(),
                    user_id: user_id.to_string(),
                    content: format!("memory {id}"),
                    created_at: now,
                    valid_at: now,
                    state: MemoryState::Active,
                    categories: vec![],
                    tags: vec![],
                    app_name: None,
                })
                .collect())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    /// Scores memory "c" highest, everything else low.
    struct PreferC;

    #[async_trait]
    impl LlmClient for PreferC {
        async fn chat(&self, request: ChatRequest) -> EngineResult<String> {
            let user = &request.messages[1].content;
            Ok(if user.contains("memory c") { "9" } else { "2" }.to_string())
        }
    }

    fn engine(backend: MockBackend) -> (Arc<MockBackend>, HybridSearch) {
        let backend = Arc::new(backend);
        let search = HybridSearch::new(backend.clone(), Arc::new(FixedEmbedder), &RecallConfig::default());
        (backend, search)
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.id()).collect()
    }

    #[tokio::test]
    async fn test_hybrid_fuses_and_keeps_fused_order() {
        let (backend, search) = engine(MockBackend::new(vec!["a", "b", "c"], vec!["c", "d"]));
        let out = search.search("query", &SearchOptions::new("u1").top_k(3)).await.unwrap();
        assert_eq!(ids(&out), vec!["c", "a", "b"]);
        assert!(out[0].ranking.in_both_arms());
        assert_eq!(backend.hydrate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_query_and_zero_top_k_skip_store() {
        let (backend, search) = engine(MockBackend::new(vec!["a"], vec!["a"]));
        assert!(search.search("   ", &SearchOptions::new("u1")).await.unwrap().is_empty());
        assert!(search.search("q", &SearchOptions::new("u1").top_k(0)).await.unwrap().is_empty());
        assert_eq!(backend.arm_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.hydrate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_text_arm_failure_degrades_to_vector() {
        let mut backend = MockBackend::new(vec![], vec!["x", "y"]);
        backend.text = Err("no fts");
        let (_, search) = engine(backend);
        let out = search.search("q", &SearchOptions::new("u1")).await.unwrap();
        assert_eq!(ids(&out), vec!["x", "y"]);
        assert!(out.iter().all(|r| r.ranking.text_rank.is_none()));
    }

    #[tokio::test]
    async fn test_both_arms_failing_surfaces_error() {
        let mut backend = MockBackend::new(vec![], vec![]);
        backend.text = Err("no fts");
        backend.vector = Err("no vectors");
        let (_, search) = engine(backend);
        let err = search.search("q", &SearchOptions::new("u1")).await.unwrap_err();
        assert!(err.to_string().contains("no vectors"));
    }

    #[tokio::test]
    async fn test_text_only_mode_surfaces_failure() {
        let mut backend = MockBackend::new(vec![], vec!["x"]);
        backend.text = Err("no fts");
        let (_, search) = engine(backend);
        let opts = SearchOptions::new("u1").mode(SearchMode::Text);
        assert!(matches!(search.search("q", &opts).await, Err(EngineError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_missing_rows_are_dropped() {
        let mut backend = MockBackend::new(vec!["a", "b", "c"], vec![]);
        backend.live.remove("b");
        let (_, search) = engine(backend);
        let out = search.search("q", &SearchOptions::new("u1")).await.unwrap();
        assert_eq!(ids(&out), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_cross_encoder_reorders_to_top_n() {
        let (_, search) = engine(MockBackend::new(vec!["a", "b", "c"], vec![]));
        let search = search.with_llm(Arc::new(PreferC), &RecallConfig::default());
        let opts = SearchOptions::new("u1").rerank(RerankMode::CrossEncoder, Some(2));
        let out = search.search("q", &opts).await.unwrap();
        assert_eq!(ids(&out), vec!["c", "a"]);
        assert_eq!(out[0].rerank_score, Some(9.0));
    }

    #[tokio::test]
    async fn test_cross_encoder_without_llm_keeps_fused_order() {
        let (_, search) = engine(MockBackend::new(vec!["a", "b", "c"], vec![]));
        let opts = SearchOptions::new("u1").rerank(RerankMode::CrossEncoder, Some(2));
        let out = search.search("q", &opts).await.unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
        assert!(out.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_candidate_size_caps_each_arm() {
        let (backend, search) = engine(MockBackend::new(vec!["a", "b", "c", "d"], vec!["d", "c", "b"]));
        let opts = SearchOptions::new("u1").top_k(4).candidate_size(2);
        let out = search.search("q", &opts).await.unwrap();
        assert_eq!(*backend.arm_limits.lock(), vec![2, 2]);
        let mut got = ids(&out);
        got.sort();
        assert_eq!(got, vec!["a", "b", "c", "d"]);
    }
}
