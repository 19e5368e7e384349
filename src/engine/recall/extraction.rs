// ── Recall: Entity Extraction Worker ────────────────────────────────────────
//
// Per-memory state machine:
//
//   load ─┬─ missing memory / owner ──────────────▶ Skipped   (no writes)
//         ├─ status done ─────────────────────────▶ AlreadyDone (no writes)
//         └─ begin (pending, attempts+1)
//              └─ LLM extract → dedupe → batch tier-1 probe
//                   → resolve + link each candidate (bounded fan-out)
//                   → relations between resolved endpoints
//                   ─┬─ ok  ─▶ done    ▶ Completed
//                    └─ err ─▶ failed  ▶ Failed
//
// `process` never returns an error: every failure after `begin` is recorded
// on the memory row and reported through the outcome.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::{ChatMessage, ChatRequest, RecallConfig};
use crate::atoms::traits::{Embedder, EntityStore, ExtractionStore, LlmClient};
use crate::atoms::types::{EntityCandidate, EntityKey, ExtractionStatus, RelationCandidate};
use crate::engine::limiter::ConcurrencyLimiter;
use crate::engine::recall::entities::{validated_key, EntityResolver, ResolvedEntity};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const EXTRACTION_SYSTEM_PROMPT: &str = r#"Extract the named entities and the relations between them from the user's memory.
Return ONLY a JSON object of the form:
{"entities":[{"name":"...","type":"person|organization|place|technology|project|concept|event|other","description":"..."}],
 "relations":[{"source":"<entity name>","target":"<entity name>","description":"..."}]}
Use short, factual descriptions. Return {"entities":[],"relations":[]} when there is nothing to extract."#;

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Memory or owning user is missing.
    Skipped,
    AlreadyDone,
    Completed { entities: usize, relations: usize },
    Failed { error: String },
}

impl ExtractionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ExtractionOutcome::Failed { .. })
    }
}

/// Entities and relations as parsed from the model, before resolution.
#[derive(Debug, Default, PartialEq)]
pub struct ExtractionPayload {
    pub entities: Vec<EntityCandidate>,
    pub relations: Vec<RelationCandidate>,
}

#[derive(Deserialize, Default)]
struct RawPayload {
    #[serde(default)]
    entities: Vec<Value>,
    #[serde(default)]
    relations: Vec<Value>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════

/// Parse model output into a payload. Tolerates markdown code fences and
/// prose around the JSON object; individual malformed items are dropped.
pub fn parse_extraction(raw: &str) -> EngineResult<ExtractionPayload> {
    let body = strip_code_fence(raw.trim());
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => {
            return Err(EngineError::Invalid(format!(
                "extraction reply has no JSON object: {}",
                excerpt(raw)
            )))
        }
    };
    let parsed: RawPayload = serde_json::from_str(json)?;

    let entities = parsed
        .entities
        .into_iter()
        .filter_map(|v| serde_json::from_value::<EntityCandidate>(v).ok())
        .collect();
    let relations = parsed
        .relations
        .into_iter()
        .filter_map(|v| serde_json::from_value::<RelationCandidate>(v).ok())
        .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
        .collect();
    Ok(ExtractionPayload { entities, relations })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip a language tag on the opening fence line.
    let after = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') => &after[nl + 1..],
        _ => after,
    };
    match after.find("```") {
        Some(end) => &after[..end],
        None => after,
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(120).collect()
}

/// Drop blank names and collapse duplicates by identity key, keeping the
/// first-seen spelling and the longest description.
pub fn dedupe_candidates(candidates: Vec<EntityCandidate>) -> Vec<(EntityKey, EntityCandidate)> {
    let mut order: Vec<(EntityKey, EntityCandidate)> = Vec::new();
    let mut index: HashMap<EntityKey, usize> = HashMap::new();
    for candidate in candidates {
        let Ok(key) = validated_key(&candidate) else {
            continue;
        };
        match index.get(&key) {
            Some(&i) => {
                let kept = &mut order[i].1;
                if candidate.description.trim().len() > kept.description.trim().len() {
                    kept.description = candidate.description;
                }
            }
            None => {
                index.insert(key.clone(), order.len());
                order.push((key, candidate));
            }
        }
    }
    order
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════

pub struct EntityExtractionWorker {
    store: Arc<dyn ExtractionStore>,
    entities: Arc<dyn EntityStore>,
    resolver: EntityResolver,
    llm: Arc<dyn LlmClient>,
    limiter: ConcurrencyLimiter,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl EntityExtractionWorker {
    pub fn new<S>(store: Arc<S>, llm: Arc<dyn LlmClient>, config: &RecallConfig) -> Self
    where
        S: ExtractionStore + EntityStore + 'static,
    {
        let entities: Arc<dyn EntityStore> = store.clone();
        Self {
            store,
            resolver: EntityResolver::new(entities.clone(), config).with_judge(llm.clone()),
            entities,
            llm,
            limiter: ConcurrencyLimiter::new(config.extraction.concurrency),
            model: config.extraction_model().to_string(),
            temperature: config.extraction.temperature,
            max_tokens: config.extraction.max_tokens,
        }
    }

    /// Enable semantic (tier-3) resolution and entity embeddings.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.resolver = self.resolver.with_embedder(embedder);
        self
    }

    /// Bound candidate fan-out with a limiter shared across workers.
    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Run the state machine for one memory.
    pub async fn process(&self, memory_id: &str) -> ExtractionOutcome {
        let target = match self.store.load_extraction_target(memory_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                info!("[recall:extract] Memory {} not found, skipping", memory_id);
                return ExtractionOutcome::Skipped;
            }
            Err(e) => {
                error!("[recall:extract] Could not load memory {}: {}", memory_id, e);
                return ExtractionOutcome::Failed { error: e.to_string() };
            }
        };
        let Some(user_id) = target.user_id else {
            info!("[recall:extract] Memory {} has no owner, skipping", memory_id);
            return ExtractionOutcome::Skipped;
        };
        if target.status == ExtractionStatus::Done {
            debug!("[recall:extract] Memory {} already extracted", memory_id);
            return ExtractionOutcome::AlreadyDone;
        }

        // Another run may have finished between the load and the claim.
        let attempt = match self.store.begin_extraction(memory_id).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                debug!("[recall:extract] Memory {} finished by another run", memory_id);
                return ExtractionOutcome::AlreadyDone;
            }
            Err(e) => {
                error!("[recall:extract] Could not mark {} pending: {}", memory_id, e);
                return ExtractionOutcome::Failed { error: e.to_string() };
            }
        };

        let result = match self.extract_and_link(memory_id, &user_id, &target.content).await {
            Ok(counts) => self.store.complete_extraction(memory_id).await.map(|_| counts),
            Err(e) => Err(e),
        };

        match result {
            Ok((entities, relations)) => {
                info!(
                    "[recall:extract] Memory {} → {} entities, {} relations",
                    memory_id, entities, relations
                );
                ExtractionOutcome::Completed { entities, relations }
            }
            Err(e) => {
                let message = e.to_string();
                error!("[recall:extract] Extraction failed for {}: {}", memory_id, message);
                match self.store.fail_extraction(memory_id, attempt, &message).await {
                    Ok(true) => {}
                    Ok(false) => debug!(
                        "[recall:extract] Attempt {} for {} superseded, failure not recorded",
                        attempt, memory_id
                    ),
                    Err(e) => error!("[recall:extract] Could not record failure for {}: {}", memory_id, e),
                }
                ExtractionOutcome::Failed { error: message }
            }
        }
    }

    /// Detach `process` on the tokio runtime.
    pub fn spawn(self: &Arc<Self>, memory_id: impl Into<String>) -> tokio::task::JoinHandle<ExtractionOutcome> {
        let worker = Arc::clone(self);
        let memory_id = memory_id.into();
        tokio::spawn(async move { worker.process(&memory_id).await })
    }

    async fn call_model(&self, content: &str) -> EngineResult<ExtractionPayload> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(EXTRACTION_SYSTEM_PROMPT), ChatMessage::user(content)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let reply = self.llm.chat(request).await?;
        parse_extraction(&reply)
    }

    async fn extract_and_link(&self, memory_id: &str, user_id: &str, content: &str) -> EngineResult<(usize, usize)> {
        let payload = self.call_model(content).await?;
        let candidates = dedupe_candidates(payload.entities);
        if candidates.is_empty() {
            return Ok((0, 0));
        }

        let keys: Vec<EntityKey> = candidates.iter().map(|(k, _)| k.clone()).collect();
        let exact = self.entities.find_exact(user_id, &keys).await?;
        debug!(
            "[recall:extract] {} candidates, {} exact hits for memory {}",
            candidates.len(),
            exact.len(),
            memory_id
        );

        let resolved = join_all(candidates.iter().map(|(key, candidate)| {
            let hit = exact.get(key).cloned();
            self.limiter.run(move || self.resolve_and_link(memory_id, user_id, key, candidate, hit))
        }))
        .await
        .into_iter()
        .collect::<EngineResult<Vec<ResolvedEntity>>>()?;

        // Relations name their endpoints; match on normalized name, first type wins.
        let mut by_name: HashMap<String, String> = HashMap::new();
        for ((key, _), entity) in candidates.iter().zip(&resolved) {
            by_name.entry(key.normalized_name.clone()).or_insert_with(|| entity.id.clone());
        }

        let mut relations = 0;
        for relation in &payload.relations {
            let source = by_name.get(&EntityCandidate::new(relation.source.as_str(), "", "").normalized_name());
            let target = by_name.get(&EntityCandidate::new(relation.target.as_str(), "", "").normalized_name());
            match (source, target) {
                (Some(s), Some(t)) if s != t => {
                    self.entities.relate_entities(s, t, relation.description.trim()).await?;
                    relations += 1;
                }
                _ => warn!(
                    "[recall:extract] Dropping relation {} → {}: endpoint not resolved",
                    relation.source, relation.target
                ),
            }
        }

        let mut distinct: Vec<&str> = resolved.iter().map(|r| r.id.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        Ok((distinct.len(), relations))
    }

    async fn resolve_and_link(
        &self,
        memory_id: &str,
        user_id: &str,
        key: &EntityKey,
        candidate: &EntityCandidate,
        exact_hit: Option<String>,
    ) -> EngineResult<ResolvedEntity> {
        let resolved = match exact_hit {
            Some(id) => self.resolver.absorb_exact(id, candidate).await?,
            None => self.resolver.resolve_unmatched(candidate, key, user_id).await?,
        };
        self.store.link_memory_entity(memory_id, &resolved.id).await?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let payload = parse_extraction(
            r#"{"entities":[{"name":"Rust","type":"technology","description":"a language"}],
                "relations":[{"source":"Rust","target":"Mozilla","description":"created by"}]}"#,
        )
        .unwrap();
        assert_eq!(payload.entities, vec![EntityCandidate::new("Rust", "technology", "a language")]);
        assert_eq!(payload.relations.len(), 1);
    }

    #[test]
    fn test_parse_tolerates_fences_and_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"entities\":[{\"name\":\"Alice\",\"type\":\"person\"}]}\n```\nHope that helps.";
        let payload = parse_extraction(raw).unwrap();
        assert_eq!(payload.entities[0].name, "Alice");
        assert!(payload.relations.is_empty());
    }

    #[test]
    fn test_parse_drops_malformed_items() {
        let raw = r#"{"entities":[{"type":"person"},{"name":"Bob"}],"relations":[{"source":"","target":"Bob"}]}"#;
        let payload = parse_extraction(raw).unwrap();
        assert_eq!(payload.entities.len(), 1);
        assert_eq!(payload.entities[0].entity_type, "");
        assert!(payload.relations.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(parse_extraction("no entities here"), Err(EngineError::Invalid(_))));
        assert!(parse_extraction("{not json}").is_err());
    }

    #[test]
    fn test_dedupe_keeps_longest_description() {
        let deduped = dedupe_candidates(vec![
            EntityCandidate::new("Open-AI", "org", "lab"),
            EntityCandidate::new("   ", "org", "blank"),
            EntityCandidate::new("openai", "Org", "an AI research lab"),
            EntityCandidate::new("OpenAI", "product", ""),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].1.name, "Open-AI");
        assert_eq!(deduped[0].1.description, "an AI research lab");
        assert_eq!(deduped[1].0.entity_type, "product");
    }
}
