// ── Recall: Tiered Entity Resolution ────────────────────────────────────────
//
// Map an extracted mention onto a canonical entity in the user's graph,
// cheapest check first:
//
//   Tier 1  exact (normalized name, type)
//   Tier 2  recorded alias, then Jaro–Winkler over normalized names
//   Tier 3  embedding cosine; an LLM judge settles the ambiguous band
//   Create  atomic upsert on (user, type, normalized name)
//
// A tier-2/3 match records the mention's normalized name as an alias so the
// next occurrence is a cheap tier-2 alias hit.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::{ChatMessage, ChatRequest, RecallConfig, ResolutionConfig};
use crate::atoms::traits::{Embedder, EntityStore, LlmClient};
use crate::atoms::types::{Entity, EntityCandidate, EntityKey, NewEntity};
use crate::engine::store::cosine_similarity;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const JUDGE_SYSTEM_PROMPT: &str = "You decide whether two descriptions refer to the same \
real-world entity. Answer with exactly one word: yes or no.";

/// Which check produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    Exact,
    Alias,
    Fuzzy,
    Semantic,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub id: String,
    /// True only when this call inserted the entity.
    pub created: bool,
    pub tier: ResolutionTier,
}

impl ResolvedEntity {
    fn matched(id: String, tier: ResolutionTier) -> Self {
        Self { id, created: false, tier }
    }
}

pub struct EntityResolver {
    store: Arc<dyn EntityStore>,
    embedder: Option<Arc<dyn Embedder>>,
    judge: Option<Arc<dyn LlmClient>>,
    config: ResolutionConfig,
    judge_model: String,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn EntityStore>, config: &RecallConfig) -> Self {
        Self {
            store,
            embedder: None,
            judge: None,
            config: config.resolution.clone(),
            judge_model: config.judge_model().to_string(),
        }
    }

    /// Enable tier 3 and store embeddings on new entities.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// LLM used for ambiguous tier-3 similarities.
    pub fn with_judge(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.judge = Some(llm);
        self
    }

    /// Resolve one candidate through every tier.
    pub async fn resolve(&self, candidate: &EntityCandidate, user_id: &str) -> EngineResult<ResolvedEntity> {
        let key = validated_key(candidate)?;
        let hits = self.store.find_exact(user_id, std::slice::from_ref(&key)).await?;
        if let Some(id) = hits.get(&key) {
            return self.absorb_exact(id.clone(), candidate).await;
        }
        self.resolve_unmatched(candidate, &key, user_id).await
    }

    /// Tier-1 hit found elsewhere (e.g. the worker's batch probe).
    pub(crate) async fn absorb_exact(&self, id: String, candidate: &EntityCandidate) -> EngineResult<ResolvedEntity> {
        self.merge_description(&id, candidate).await?;
        Ok(ResolvedEntity::matched(id, ResolutionTier::Exact))
    }

    /// Tiers 2, 3 and create, for a candidate already known to miss tier 1.
    pub(crate) async fn resolve_unmatched(
        &self,
        candidate: &EntityCandidate,
        key: &EntityKey,
        user_id: &str,
    ) -> EngineResult<ResolvedEntity> {
        // ── Tier 2a: alias table ───────────────────────────────────────────
        if let Some(id) = self.store.find_by_alias(user_id, key).await? {
            debug!("[recall:entity] '{}' matched by alias → {}", candidate.name, id);
            self.merge_description(&id, candidate).await?;
            return Ok(ResolvedEntity::matched(id, ResolutionTier::Alias));
        }

        let existing = self.store.list_entities(user_id, &key.entity_type).await?;

        // ── Tier 2b: fuzzy name ────────────────────────────────────────────
        if let Some((entity, sim)) = self.best_fuzzy(&key.normalized_name, &existing) {
            info!(
                "[recall:entity] '{}' fuzzy-matched '{}' ({:.3})",
                candidate.name, entity.name, sim
            );
            let id = entity.id.clone();
            self.absorb_match(&id, candidate, key).await?;
            return Ok(ResolvedEntity::matched(id, ResolutionTier::Fuzzy));
        }

        // ── Tier 3: semantic ───────────────────────────────────────────────
        let embedding = self.embed_candidate(candidate).await;
        if let Some(vector) = embedding.as_deref() {
            if let Some(id) = self.semantic_match(candidate, vector, &existing).await {
                self.absorb_match(&id, candidate, key).await?;
                return Ok(ResolvedEntity::matched(id, ResolutionTier::Semantic));
            }
        }

        // ── Create ─────────────────────────────────────────────────────────
        let upsert = self
            .store
            .upsert_entity(
                user_id,
                &NewEntity {
                    name: candidate.name.trim().to_string(),
                    key: key.clone(),
                    description: candidate.description.trim().to_string(),
                    embedding,
                },
            )
            .await?;
        if upsert.created {
            info!(
                "[recall:entity] New entity: {} ({}) → {}",
                candidate.name, key.entity_type, upsert.id
            );
            Ok(ResolvedEntity { id: upsert.id, created: true, tier: ResolutionTier::Created })
        } else {
            // Another writer created the same key between our probe and upsert.
            debug!("[recall:entity] Lost create race for '{}', using {}", candidate.name, upsert.id);
            Ok(ResolvedEntity::matched(upsert.id, ResolutionTier::Exact))
        }
    }

    async fn merge_description(&self, id: &str, candidate: &EntityCandidate) -> EngineResult<()> {
        let description = candidate.description.trim();
        if !description.is_empty() && self.store.update_description_if_longer(id, description).await? {
            debug!("[recall:entity] Description of {} replaced by a longer one", id);
        }
        Ok(())
    }

    async fn absorb_match(&self, id: &str, candidate: &EntityCandidate, key: &EntityKey) -> EngineResult<()> {
        self.merge_description(id, candidate).await?;
        self.store.add_alias(id, key).await
    }

    fn best_fuzzy<'a>(&self, name: &str, existing: &'a [Entity]) -> Option<(&'a Entity, f64)> {
        let min_len = self.config.fuzzy_min_name_len;
        if name.chars().count() < min_len {
            return None;
        }
        existing
            .iter()
            .filter(|e| e.normalized_name.chars().count() >= min_len)
            .map(|e| (e, strsim::jaro_winkler(name, &e.normalized_name)))
            .filter(|(_, sim)| *sim >= self.config.fuzzy_threshold)
            .fold(None, |best: Option<(&Entity, f64)>, (e, sim)| match best {
                Some((_, b)) if b >= sim => best,
                _ => Some((e, sim)),
            })
    }

    /// Embedding for tier 3 and for storage on create. Failure only disables tier 3.
    async fn embed_candidate(&self, candidate: &EntityCandidate) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&entity_text(candidate)).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                warn!("[recall:entity] Embedding '{}' failed, skipping semantic tier: {}", candidate.name, e);
                None
            }
        }
    }

    async fn semantic_match(
        &self,
        candidate: &EntityCandidate,
        vector: &[f32],
        existing: &[Entity],
    ) -> Option<String> {
        let (entity, sim) = existing
            .iter()
            .filter_map(|e| e.embedding.as_deref().map(|emb| (e, cosine_similarity(vector, emb))))
            .fold(None, |best: Option<(&Entity, f64)>, (e, sim)| match best {
                Some((_, b)) if b >= sim => best,
                _ => Some((e, sim)),
            })?;

        if sim >= self.config.semantic_match_threshold {
            info!(
                "[recall:entity] '{}' semantically matched '{}' ({:.3})",
                candidate.name, entity.name, sim
            );
            return Some(entity.id.clone());
        }
        if sim >= self.config.semantic_judge_floor && self.config.llm_judge {
            let judge = self.judge.as_ref()?;
            if self.judge_same(judge.as_ref(), candidate, entity).await {
                info!(
                    "[recall:entity] Judge confirmed '{}' is '{}' ({:.3})",
                    candidate.name, entity.name, sim
                );
                return Some(entity.id.clone());
            }
        }
        None
    }

    async fn judge_same(&self, judge: &dyn LlmClient, candidate: &EntityCandidate, entity: &Entity) -> bool {
        let request = ChatRequest {
            model: self.judge_model.clone(),
            messages: vec![
                ChatMessage::system(JUDGE_SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "A: {} ({}): {}\nB: {} ({}): {}\n\nSame entity?",
                    candidate.name.trim(),
                    entity.entity_type,
                    candidate.description.trim(),
                    entity.name,
                    entity.entity_type,
                    entity.description
                )),
            ],
            temperature: 0.0,
            max_tokens: 3,
        };
        match judge.chat(request).await {
            Ok(reply) => reply.trim().to_lowercase().starts_with("yes"),
            Err(e) => {
                warn!("[recall:entity] Judge call failed, treating as distinct: {}", e);
                false
            }
        }
    }
}

/// Identity key for a candidate. Blank names have none.
pub(crate) fn validated_key(candidate: &EntityCandidate) -> EngineResult<EntityKey> {
    let key = candidate.key();
    if candidate.name.trim().is_empty() || key.normalized_name.is_empty() {
        return Err(EngineError::Invalid(format!("entity name '{}' is blank", candidate.name)));
    }
    Ok(key)
}

/// Text embedded for an entity: "name: description", or the bare name.
fn entity_text(candidate: &EntityCandidate) -> String {
    let name = candidate.name.trim();
    let description = candidate.description.trim();
    if description.is_empty() {
        name.to_string()
    } else {
        format!("{name}: {description}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::GraphStore;
    use async_trait::async_trait;

    /// Places texts on fixed directions so cosine similarity is predictable.
    struct CompassEmbedder;

    #[async_trait]
    impl Embedder for CompassEmbedder {
        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            if text.contains("New York") || text.contains("Big Apple") {
                Ok(vec![1.0, 0.0, 0.0])
            } else if text.contains("Gotham") {
                Ok(vec![0.8, 0.6, 0.0])
            } else {
                Ok(vec![0.0, 0.0, 1.0])
            }
        }
        fn model_name(&self) -> &str {
            "compass"
        }
    }

    struct Judge(&'static str);

    #[async_trait]
    impl LlmClient for Judge {
        async fn chat(&self, _request: ChatRequest) -> EngineResult<String> {
            Ok(self.0.to_string())
        }
    }

    fn setup() -> (Arc<GraphStore>, EntityResolver) {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        store.ensure_user("u1", "").unwrap();
        let resolver = EntityResolver::new(store.clone(), &RecallConfig::default());
        (store, resolver)
    }

    #[tokio::test]
    async fn test_exact_resolution_is_idempotent() {
        let (store, resolver) = setup();
        let first = resolver.resolve(&EntityCandidate::new("Rust", "technology", "a language"), "u1").await.unwrap();
        assert!(first.created);
        assert_eq!(first.tier, ResolutionTier::Created);

        let again = resolver
            .resolve(&EntityCandidate::new("rust", "Technology", "a systems programming language"), "u1")
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert!(!again.created);
        assert_eq!(again.tier, ResolutionTier::Exact);
        let entity = store.get_entity(&first.id).unwrap().unwrap();
        assert_eq!(entity.description, "a systems programming language");
        assert_eq!(store.count_entities("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_name_different_type_is_distinct() {
        let (store, resolver) = setup();
        let a = resolver.resolve(&EntityCandidate::new("Rust", "technology", ""), "u1").await.unwrap();
        let b = resolver.resolve(&EntityCandidate::new("Rust", "game", ""), "u1").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.count_entities("u1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let (_, resolver) = setup();
        let err = resolver.resolve(&EntityCandidate::new("  - ", "thing", ""), "u1").await.unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_fuzzy_match_records_alias() {
        let (store, resolver) = setup();
        let k8s = resolver.resolve(&EntityCandidate::new("Kubernetes", "technology", ""), "u1").await.unwrap();

        let typo = resolver.resolve(&EntityCandidate::new("Kubernetess", "technology", ""), "u1").await.unwrap();
        assert_eq!(typo.id, k8s.id);
        assert_eq!(typo.tier, ResolutionTier::Fuzzy);
        assert_eq!(store.entity_aliases(&k8s.id).unwrap(), vec!["kubernetess".to_string()]);

        let again = resolver.resolve(&EntityCandidate::new("kubernetess", "technology", ""), "u1").await.unwrap();
        assert_eq!(again.tier, ResolutionTier::Alias);
        assert_eq!(again.id, k8s.id);
    }

    #[tokio::test]
    async fn test_short_names_never_fuzzy_match() {
        let (_, resolver) = setup();
        let vuex = resolver.resolve(&EntityCandidate::new("Vuex", "technology", ""), "u1").await.unwrap();
        let vue = resolver.resolve(&EntityCandidate::new("Vue", "technology", ""), "u1").await.unwrap();
        assert_ne!(vue.id, vuex.id);
        assert!(vue.created);
    }

    #[tokio::test]
    async fn test_semantic_match_above_threshold() {
        let (store, resolver) = setup();
        let resolver = resolver.with_embedder(Arc::new(CompassEmbedder));
        let nyc = resolver
            .resolve(&EntityCandidate::new("New York City", "place", "largest US city"), "u1")
            .await
            .unwrap();
        let apple = resolver
            .resolve(&EntityCandidate::new("Big Apple", "place", "nickname"), "u1")
            .await
            .unwrap();
        assert_eq!(apple.id, nyc.id);
        assert_eq!(apple.tier, ResolutionTier::Semantic);
        assert_eq!(store.entity_aliases(&nyc.id).unwrap(), vec!["bigapple".to_string()]);
    }

    #[tokio::test]
    async fn test_ambiguous_similarity_defers_to_judge() {
        let (_, resolver) = setup();
        let yes = resolver.with_embedder(Arc::new(CompassEmbedder)).with_judge(Arc::new(Judge("Yes.")));
        let nyc = yes.resolve(&EntityCandidate::new("New York City", "place", ""), "u1").await.unwrap();
        let gotham = yes.resolve(&EntityCandidate::new("Gotham", "place", ""), "u1").await.unwrap();
        assert_eq!(gotham.id, nyc.id);
        assert_eq!(gotham.tier, ResolutionTier::Semantic);
    }

    #[tokio::test]
    async fn test_judge_rejection_creates_entity() {
        let (_, resolver) = setup();
        let no = resolver.with_embedder(Arc::new(CompassEmbedder)).with_judge(Arc::new(Judge("no")));
        let nyc = no.resolve(&EntityCandidate::new("New York City", "place", ""), "u1").await.unwrap();
        let gotham = no.resolve(&EntityCandidate::new("Gotham", "place", ""), "u1").await.unwrap();
        assert_ne!(gotham.id, nyc.id);
        assert!(gotham.created);
    }

    #[tokio::test]
    async fn test_ambiguous_without_judge_creates_entity() {
        let (_, resolver) = setup();
        let resolver = resolver.with_embedder(Arc::new(CompassEmbedder));
        let nyc = resolver.resolve(&EntityCandidate::new("New York City", "place", ""), "u1").await.unwrap();
        let gotham = resolver.resolve(&EntityCandidate::new("Gotham", "place", ""), "u1").await.unwrap();
        assert_ne!(gotham.id, nyc.id);
    }
}
