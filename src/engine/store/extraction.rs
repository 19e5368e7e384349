// ── Graph Store: Extraction bookkeeping ─────────────────────────────────────
//
// extraction_status / extraction_attempts / extraction_error on the memory
// row, and the idempotent memory → entity link table.

use super::{now_ts, GraphStore};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::ExtractionStore;
use crate::atoms::types::{ExtractionStatus, ExtractionTarget};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

impl GraphStore {
    /// Content, status and owner. The owner is `None` when the user row is
    /// missing even if the memory references one.
    pub fn extraction_target(&self, memory_id: &str) -> EngineResult<Option<ExtractionTarget>> {
        let conn = self.conn.lock();
        let target = conn
            .query_row(
                "SELECT m.id, m.content, m.extraction_status, u.id
                 FROM memories m
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.id = ?1",
                params![memory_id],
                |r| {
                    let status: Option<String> = r.get(2)?;
                    Ok(ExtractionTarget {
                        memory_id: r.get(0)?,
                        content: r.get(1)?,
                        status: ExtractionStatus::from_db(status.as_deref()),
                        user_id: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(target)
    }

    /// Entity ids linked to a memory.
    pub fn memory_entity_ids(&self, memory_id: &str) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM memory_entities WHERE memory_id = ?1 ORDER BY created_at, entity_id",
        )?;
        let ids = stmt
            .query_map(params![memory_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Live memories whose extraction never finished (`absent`, `failed`, or
    /// left `pending` by a crash), oldest first. Lets a caller re-submit work
    /// after a restart.
    pub fn memories_needing_extraction(&self, limit: usize) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM memories
             WHERE (extraction_status IS NULL OR extraction_status IN ('failed', 'pending'))
               AND invalid_at IS NULL AND state != 'deleted'
             ORDER BY created_at
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit as i64], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl ExtractionStore for GraphStore {
    async fn load_extraction_target(&self, memory_id: &str) -> EngineResult<Option<ExtractionTarget>> {
        self.extraction_target(memory_id)
    }

    async fn begin_extraction(&self, memory_id: &str) -> EngineResult<Option<u32>> {
        let conn = self.conn.lock();
        let attempt = conn
            .query_row(
                "UPDATE memories
                 SET extraction_status = 'pending',
                     extraction_attempts = extraction_attempts + 1,
                     extraction_error = NULL
                 WHERE id = ?1 AND extraction_status IS NOT 'done'
                 RETURNING extraction_attempts",
                params![memory_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        Ok(attempt.map(|n| n.max(0) as u32))
    }

    async fn complete_extraction(&self, memory_id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE memories SET extraction_status = 'done', extraction_error = NULL
             WHERE id = ?1 AND extraction_status IS NOT 'done'",
            params![memory_id],
        )?;
        Ok(n > 0)
    }

    async fn fail_extraction(&self, memory_id: &str, attempt: u32, error: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE memories SET extraction_status = 'failed', extraction_error = ?3
             WHERE id = ?1 AND extraction_status = 'pending' AND extraction_attempts = ?2",
            params![memory_id, attempt as i64, error],
        )?;
        Ok(n > 0)
    }

    async fn link_memory_entity(&self, memory_id: &str, entity_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![memory_id, entity_id, now_ts()],
        )?;
        Ok(())
    }

    async fn extraction_status(&self, memory_id: &str) -> EngineResult<Option<(ExtractionStatus, u32)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT extraction_status, extraction_attempts FROM memories WHERE id = ?1",
                params![memory_id],
                |r| {
                    let status: Option<String> = r.get(0)?;
                    let attempts: i64 = r.get(1)?;
                    Ok((ExtractionStatus::from_db(status.as_deref()), attempts.max(0) as u32))
                },
            )
            .optional()?;
        Ok(row)
    }
}
