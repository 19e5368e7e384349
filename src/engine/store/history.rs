// ── Graph Store: History ledger ─────────────────────────────────────────────
// Append-only rows; the only delete is the administrative reset.

use super::{ts_col, GraphStore};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::HistoryStore;
use crate::atoms::types::{format_timestamp, HistoryAction, HistoryRecord};
use async_trait::async_trait;
use rusqlite::params;

#[async_trait]
impl HistoryStore for GraphStore {
    async fn append_history(&self, record: &HistoryRecord) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_history (id, memory_id, previous_value, new_value, action,
                                         created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.memory_id,
                record.previous_value,
                record.new_value,
                record.action.as_str(),
                format_timestamp(&record.created_at),
                record.updated_at.as_ref().map(format_timestamp),
                record.is_deleted as i32,
            ],
        )?;
        Ok(())
    }

    async fn list_history(&self, memory_id: &str, limit: usize) -> EngineResult<Vec<HistoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, memory_id, previous_value, new_value, action, created_at, updated_at, is_deleted
             FROM memory_history
             WHERE memory_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![memory_id, limit as i64], |r| {
                let action: String = r.get(4)?;
                let created_at: String = r.get(5)?;
                let updated_at: Option<String> = r.get(6)?;
                let is_deleted: i32 = r.get(7)?;
                Ok(HistoryRecord {
                    id: r.get(0)?,
                    memory_id: r.get(1)?,
                    previous_value: r.get(2)?,
                    new_value: r.get(3)?,
                    action: HistoryAction::parse(&action),
                    created_at: ts_col(&created_at),
                    updated_at: updated_at.as_deref().map(ts_col),
                    is_deleted: is_deleted != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn reset_history(&self) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM memory_history", [])?;
        Ok(n)
    }
}
