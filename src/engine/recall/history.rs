// ── Recall: Memory History Ledger ───────────────────────────────────────────
// Append-only audit trail over any `HistoryStore`.

use crate::atoms::constants::DEFAULT_HISTORY_LIMIT;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::HistoryStore;
use crate::atoms::types::{HistoryRecord, NewHistoryRecord};
use chrono::Utc;
use log::warn;
use std::sync::Arc;

#[derive(Clone)]
pub struct MemoryHistoryLedger {
    store: Arc<dyn HistoryStore>,
}

impl MemoryHistoryLedger {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Append one immutable record. `created_at` defaults to now.
    pub async fn add_history(&self, record: NewHistoryRecord) -> EngineResult<HistoryRecord> {
        if record.memory_id.trim().is_empty() {
            return Err(EngineError::Invalid("history record needs a memory id".into()));
        }
        let record = HistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            memory_id: record.memory_id,
            previous_value: record.previous_value,
            new_value: record.new_value,
            action: record.action,
            created_at: record.created_at.unwrap_or_else(Utc::now),
            updated_at: record.updated_at,
            is_deleted: record.is_deleted,
        };
        self.store.append_history(&record).await?;
        Ok(record)
    }

    /// Newest first. `limit` defaults to 100.
    pub async fn get_history(&self, memory_id: &str, limit: Option<usize>) -> EngineResult<Vec<HistoryRecord>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.list_history(memory_id, limit).await
    }

    /// Administrative wipe of the whole ledger.
    pub async fn reset_history(&self) -> EngineResult<usize> {
        let removed = self.store.reset_history().await?;
        warn!("[recall] History ledger reset, {} records removed", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::HistoryAction;
    use crate::engine::store::GraphStore;
    use chrono::{Duration, TimeZone};

    fn ledger() -> MemoryHistoryLedger {
        MemoryHistoryLedger::new(Arc::new(GraphStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_history_newest_first_with_limit() {
        let ledger = ledger();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (i, action) in [HistoryAction::Add, HistoryAction::Update, HistoryAction::Delete].into_iter().enumerate() {
            let mut rec = NewHistoryRecord::new("m1", action).new_value(format!("v{i}"));
            rec.created_at = Some(t0 + Duration::seconds(i as i64));
            ledger.add_history(rec).await.unwrap();
        }
        ledger.add_history(NewHistoryRecord::new("m2", HistoryAction::Add)).await.unwrap();

        let all = ledger.get_history("m1", None).await.unwrap();
        let actions: Vec<_> = all.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![HistoryAction::Delete, HistoryAction::Update, HistoryAction::Add]);
        assert_eq!(all[0].created_at, t0 + Duration::seconds(2));

        let latest = ledger.get_history("m1", Some(1)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].new_value.as_deref(), Some("v2"));
        assert!(ledger.get_history("m1", Some(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_round_trip_fields() {
        let ledger = ledger();
        let added = ledger
            .add_history(NewHistoryRecord::new("m1", HistoryAction::Delete).previous("old").deleted())
            .await
            .unwrap();
        let stored = ledger.get_history("m1", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, added.id);
        assert_eq!(stored[0].previous_value.as_deref(), Some("old"));
        assert!(stored[0].new_value.is_none());
        assert!(stored[0].is_deleted);
    }

    #[tokio::test]
    async fn test_reset_counts_rows() {
        let ledger = ledger();
        ledger.add_history(NewHistoryRecord::new("m1", HistoryAction::Add)).await.unwrap();
        ledger.add_history(NewHistoryRecord::new("m2", HistoryAction::None)).await.unwrap();
        assert_eq!(ledger.reset_history().await.unwrap(), 2);
        assert!(ledger.get_history("m1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_memory_id_rejected() {
        let ledger = ledger();
        let err = ledger.add_history(NewHistoryRecord::new(" ", HistoryAction::Add)).await.unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }
}
