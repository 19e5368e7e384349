// ── Recall: Memory Versioning ───────────────────────────────────────────────
//
// Write path for memory content. Content is never edited in place: an update
// inserts a new version and closes the old one (bitemporal supersession).
// Every write appends to the history ledger and, when a queue is attached,
// schedules entity extraction for the live version.

use crate::atoms::error::EngineResult;
use crate::atoms::traits::Embedder;
use crate::atoms::types::{HistoryAction, Memory, NewHistoryRecord, NewMemory};
use crate::engine::recall::history::MemoryHistoryLedger;
use crate::engine::recall::queue::ExtractionQueue;
use crate::engine::store::GraphStore;
use log::{info, warn};
use std::sync::Arc;

pub struct MemoryVersioning {
    store: Arc<GraphStore>,
    ledger: MemoryHistoryLedger,
    embedder: Option<Arc<dyn Embedder>>,
    queue: Option<ExtractionQueue>,
}

impl MemoryVersioning {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            ledger: MemoryHistoryLedger::new(store.clone()),
            store,
            embedder: None,
            queue: None,
        }
    }

    /// Embed content on write so the vector arm can find it.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Submit every new live version for entity extraction.
    pub fn with_queue(mut self, queue: ExtractionQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn ledger(&self) -> &MemoryHistoryLedger {
        &self.ledger
    }

    async fn embed(&self, content: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(content).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("[recall] Embedding failed, memory stored without vector: {}", e);
                None
            }
        }
    }

    fn schedule(&self, memory_id: &str) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.submit(memory_id) {
                warn!("[recall] Could not schedule extraction for {}: {}", memory_id, e);
            }
        }
    }

    /// Insert a memory (node, FTS row, embedding) and record ADD.
    pub async fn create_memory(&self, memory: NewMemory) -> EngineResult<String> {
        let embedding = self.embed(&memory.content).await;
        let id = self.store.insert_memory(&memory, embedding.as_deref())?;
        self.ledger
            .add_history(NewHistoryRecord::new(&id, HistoryAction::Add).new_value(memory.content))
            .await?;
        self.schedule(&id);
        info!("[recall] Created memory {} for user {}", id, memory.user_id);
        Ok(id)
    }

    /// Supersede `memory_id` with `new_content`. Returns the new version's id.
    /// A memory that is already superseded or deleted is a conflict.
    pub async fn update_content(&self, memory_id: &str, new_content: &str) -> EngineResult<String> {
        let embedding = self.embed(new_content).await;
        let sup = self.store.supersede_memory(memory_id, new_content, embedding.as_deref())?;
        self.ledger
            .add_history(
                NewHistoryRecord::new(memory_id, HistoryAction::Update)
                    .previous(sup.previous_content)
                    .new_value(new_content),
            )
            .await?;
        self.schedule(&sup.new_id);
        Ok(sup.new_id)
    }

    /// Soft-delete and record DELETE.
    pub async fn delete_memory(&self, memory_id: &str) -> EngineResult<()> {
        let content = self.store.mark_memory_deleted(memory_id)?;
        self.ledger
            .add_history(NewHistoryRecord::new(memory_id, HistoryAction::Delete).previous(content).deleted())
            .await?;
        info!("[recall] Deleted memory {}", memory_id);
        Ok(())
    }

    /// All versions, oldest first, given any id in the chain.
    pub fn version_chain(&self, memory_id: &str) -> EngineResult<Vec<Memory>> {
        self.store.version_chain(memory_id)
    }

    /// Re-submit live memories whose extraction never finished, oldest first.
    /// Returns how many were queued; zero when no queue is attached.
    pub fn resume_pending(&self, limit: usize) -> EngineResult<usize> {
        let Some(queue) = &self.queue else {
            return Ok(0);
        };
        let backlog = self.store.memories_needing_extraction(limit)?;
        for id in &backlog {
            queue.submit(id.as_str())?;
        }
        if !backlog.is_empty() {
            info!("[recall] Re-queued {} memories for extraction", backlog.len());
        }
        Ok(backlog.len())
    }

    /// Drain pending extraction work.
    pub async fn shutdown(self) {
        if let Some(queue) = self.queue {
            queue.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;

    fn setup() -> (Arc<GraphStore>, MemoryVersioning) {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        store.ensure_user("u1", "").unwrap();
        let versioning = MemoryVersioning::new(store.clone());
        (store, versioning)
    }

    fn new_memory(content: &str) -> NewMemory {
        NewMemory {
            user_id: "u1".into(),
            content: content.into(),
            categories: vec!["Work".into()],
            tags: vec!["t1".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_creates_new_version_and_history() {
        let (store, versioning) = setup();
        let v1 = versioning.create_memory(new_memory("likes tea")).await.unwrap();
        let v2 = versioning.update_content(&v1, "likes coffee").await.unwrap();
        assert_ne!(v1, v2);

        let old = store.get_memory(&v1).unwrap().unwrap();
        assert_eq!(old.content, "likes tea");
        assert_eq!(old.superseded_by.as_deref(), Some(v2.as_str()));
        assert!(old.invalid_at.is_some());

        let new = store.get_memory(&v2).unwrap().unwrap();
        assert!(new.is_current());
        assert_eq!(new.categories, vec!["work".to_string()]);
        assert_eq!(new.tags, vec!["t1".to_string()]);

        let history = versioning.ledger().get_history(&v1, None).await.unwrap();
        assert_eq!(history[0].action, HistoryAction::Update);
        assert_eq!(history[0].previous_value.as_deref(), Some("likes tea"));
        assert_eq!(history[0].new_value.as_deref(), Some("likes coffee"));
        assert_eq!(history[1].action, HistoryAction::Add);

        let chain: Vec<String> = versioning.version_chain(&v2).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(chain, vec![v1, v2]);
    }

    #[tokio::test]
    async fn test_updating_superseded_version_conflicts() {
        let (_, versioning) = setup();
        let v1 = versioning.create_memory(new_memory("a")).await.unwrap();
        versioning.update_content(&v1, "b").await.unwrap();
        let err = versioning.update_content(&v1, "c").await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert!(matches!(versioning.update_content("missing", "x").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_records_history() {
        let (store, versioning) = setup();
        let id = versioning.create_memory(new_memory("temp")).await.unwrap();
        versioning.delete_memory(&id).await.unwrap();
        assert!(!store.get_memory(&id).unwrap().unwrap().is_current());

        let history = versioning.ledger().get_history(&id, Some(1)).await.unwrap();
        assert_eq!(history[0].action, HistoryAction::Delete);
        assert!(history[0].is_deleted);
        assert_eq!(history[0].previous_value.as_deref(), Some("temp"));
        assert!(matches!(versioning.delete_memory(&id).await, Err(EngineError::Conflict(_))));
    }
}
