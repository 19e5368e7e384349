// ── factgraph Atoms: Boundary Traits ───────────────────────────────────────
// The seams between the recall core and its collaborators: the fact store
// (split by concern), the chat LLM, and the embedding model.
// `engine::store::GraphStore` implements every store trait over SQLite.

use crate::atoms::error::EngineResult;
use crate::atoms::recall_types::{ChatRequest, HydratedMemory};
use crate::atoms::types::{
    Entity, EntityKey, EntityUpsert, ExtractionStatus, ExtractionTarget, HistoryRecord,
    NewEntity,
};
use async_trait::async_trait;
use std::collections::HashMap;

// ── Search ─────────────────────────────────────────────────────────────────

/// Read side used by hybrid search. Every method excludes memories with
/// `invalid_at` set and memories in the `deleted` state.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Full-text arm: ids in rank order (best first), at most `limit`.
    /// Returns `EngineError::Unsupported` when the engine has no full-text index.
    async fn text_search(&self, user_id: &str, query: &str, limit: usize)
        -> EngineResult<Vec<String>>;

    /// Vector arm: ids in descending cosine similarity, at most `limit`.
    async fn vector_search(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<String>>;

    /// Fetch all `ids` in one round-trip. Order of the result is unspecified;
    /// ids without a live row are absent.
    async fn hydrate(&self, user_id: &str, ids: &[String]) -> EngineResult<Vec<HydratedMemory>>;
}

// ── Entities ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Tier-1 batch probe: exact (normalized name, type) hits → entity id.
    async fn find_exact(
        &self,
        user_id: &str,
        keys: &[EntityKey],
    ) -> EngineResult<HashMap<EntityKey, String>>;

    /// Entity id whose recorded alias equals `key` (same type).
    async fn find_by_alias(&self, user_id: &str, key: &EntityKey) -> EngineResult<Option<String>>;

    /// All entities of one type for one user, embeddings included.
    async fn list_entities(&self, user_id: &str, entity_type: &str) -> EngineResult<Vec<Entity>>;

    /// Atomic create-or-merge on (user, type, normalized name). When the key
    /// exists, the description is merged longest-wins and the existing id returned.
    async fn upsert_entity(&self, user_id: &str, entity: &NewEntity) -> EngineResult<EntityUpsert>;

    /// Replace the description only if `description` is strictly longer.
    /// Returns whether a write happened.
    async fn update_description_if_longer(
        &self,
        entity_id: &str,
        description: &str,
    ) -> EngineResult<bool>;

    /// Record an alternate normalized name for an entity (idempotent).
    async fn add_alias(&self, entity_id: &str, key: &EntityKey) -> EngineResult<()>;

    /// Idempotent `RELATED_TO` edge; a longer description replaces a shorter one.
    async fn relate_entities(
        &self,
        source_id: &str,
        target_id: &str,
        description: &str,
    ) -> EngineResult<()>;
}

// ── Extraction bookkeeping ─────────────────────────────────────────────────

#[async_trait]
pub trait ExtractionStore: Send + Sync {
    /// Content, status and owning user. `None` if the memory does not exist.
    async fn load_extraction_target(&self, memory_id: &str)
        -> EngineResult<Option<ExtractionTarget>>;

    /// Claim a run: set `pending` and increment the attempt counter unless the
    /// memory is already `done`. Returns the claimed attempt number, or `None`
    /// when there is nothing to claim.
    async fn begin_extraction(&self, memory_id: &str) -> EngineResult<Option<u32>>;

    /// Mark `done` unless already `done`. Returns whether the row changed.
    async fn complete_extraction(&self, memory_id: &str) -> EngineResult<bool>;

    /// Mark `failed` only while `attempt` is still the live pending claim.
    /// A stale run never overwrites `done` or a newer attempt.
    async fn fail_extraction(&self, memory_id: &str, attempt: u32, error: &str) -> EngineResult<bool>;

    /// Idempotent memory → entity link.
    async fn link_memory_entity(&self, memory_id: &str, entity_id: &str) -> EngineResult<()>;

    /// Current status and attempt count, for polling.
    async fn extraction_status(&self, memory_id: &str)
        -> EngineResult<Option<(ExtractionStatus, u32)>>;
}

// ── History ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_history(&self, record: &HistoryRecord) -> EngineResult<()>;

    /// Newest first, at most `limit`.
    async fn list_history(&self, memory_id: &str, limit: usize) -> EngineResult<Vec<HistoryRecord>>;

    /// Delete every record. Returns the number removed.
    async fn reset_history(&self) -> EngineResult<usize>;
}

// ── Models ─────────────────────────────────────────────────────────────────

/// Non-streaming chat completion.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> EngineResult<String>;
}

/// Text → dense vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
    fn model_name(&self) -> &str;
}
