// ── Graph Store: Memories ────────────────────────────────────────────────────
//
// Users, apps, memory nodes and their categories; the supersession write path;
// the two search arms and batched hydration.
//
// Visibility rule for every read path used by search: `invalid_at IS NULL AND
// state != 'deleted'`. Superseded rows stay resident for the version chain.

use super::embedding::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use super::{now_ts, ts_col, GraphStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::HydratedMemory;
use crate::atoms::traits::SearchBackend;
use crate::atoms::types::{ExtractionStatus, Memory, MemoryState, NewMemory};
use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashSet;

const MEMORY_COLUMNS: &str = "m.id, m.user_id, m.app_id, m.content, m.created_at, m.updated_at,
     m.valid_at, m.invalid_at, m.superseded_by, m.state, m.extraction_status,
     m.extraction_attempts, m.extraction_error, m.tags,
     (SELECT json_group_array(c.name) FROM memory_categories mc
        JOIN categories c ON c.id = mc.category_id
       WHERE mc.memory_id = m.id)";

/// Outcome of a supersession write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersession {
    pub new_id: String,
    pub previous_content: String,
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let created_at: String = row.get(4)?;
    let updated_at: Option<String> = row.get(5)?;
    let valid_at: String = row.get(6)?;
    let invalid_at: Option<String> = row.get(7)?;
    let state: String = row.get(9)?;
    let status: Option<String> = row.get(10)?;
    let attempts: i64 = row.get(11)?;
    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        app_id: row.get(2)?,
        content: row.get(3)?,
        created_at: ts_col(&created_at),
        updated_at: updated_at.as_deref().map(ts_col),
        valid_at: ts_col(&valid_at),
        invalid_at: invalid_at.as_deref().map(ts_col),
        superseded_by: row.get(8)?,
        state: MemoryState::parse(&state),
        extraction_status: ExtractionStatus::from_db(status.as_deref()),
        extraction_attempts: attempts.max(0) as u32,
        extraction_error: row.get(12)?,
        tags: json_list(row.get(13)?),
        categories: json_list(row.get(14)?),
    })
}

fn load_memory(conn: &Connection, id: &str) -> rusqlite::Result<Option<Memory>> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1"),
        params![id],
        memory_from_row,
    )
    .optional()
}

fn attach_categories(tx: &Transaction<'_>, memory_id: &str, categories: &[String]) -> EngineResult<()> {
    for name in categories {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO categories (id, name) VALUES (?1, ?2)",
            params![uuid::Uuid::new_v4().to_string(), name],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO memory_categories (memory_id, category_id)
             SELECT ?1, id FROM categories WHERE name = ?2",
            params![memory_id, name],
        )?;
    }
    Ok(())
}

/// FTS5 MATCH expression: alphanumeric terms, each quoted, OR-joined.
pub(crate) fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

impl GraphStore {
    // ── Users & apps ───────────────────────────────────────────────────

    /// Create the user if missing. Existing users keep their name.
    pub fn ensure_user(&self, user_id: &str, name: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, name, now_ts()],
        )?;
        Ok(())
    }

    /// Find-or-create an app owned by `user_id`; returns its id.
    pub fn ensure_app(&self, user_id: &str, name: &str) -> EngineResult<String> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO apps (id, user_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), user_id, name, now_ts()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM apps WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    // ── Memory writes ──────────────────────────────────────────────────

    /// Insert a memory node with its categories and FTS row. Returns the id.
    pub fn insert_memory(&self, mem: &NewMemory, embedding: Option<&[f32]>) -> EngineResult<String> {
        if mem.content.trim().is_empty() {
            return Err(EngineError::Invalid("memory content is empty".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let tags = serde_json::to_string(&mem.tags)?;
        let blob = embedding.map(f32_vec_to_bytes);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memories (id, user_id, app_id, content, embedding, tags, state,
                                   created_at, valid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)",
            params![id, mem.user_id, mem.app_id, mem.content, blob, tags, now],
        )?;
        attach_categories(&tx, &id, &mem.categories)?;
        if self.fts_available {
            tx.execute(
                "INSERT INTO memories_fts (id, user_id, content) VALUES (?1, ?2, ?3)",
                params![id, mem.user_id, mem.content],
            )?;
        }
        tx.commit()?;

        debug!("[store] Inserted memory {} for user {}", id, mem.user_id);
        Ok(id)
    }

    pub fn get_memory(&self, id: &str) -> EngineResult<Option<Memory>> {
        let conn = self.conn.lock();
        Ok(load_memory(&conn, id)?)
    }

    /// Replace a memory's content by creating a new version.
    ///
    /// One transaction: insert the new node (same owner, app, tags and
    /// categories; `valid_at = now`), then close the old node with
    /// `invalid_at = now` and `superseded_by = new id`. The old row is never
    /// otherwise modified.
    pub fn supersede_memory(
        &self,
        old_id: &str,
        new_content: &str,
        embedding: Option<&[f32]>,
    ) -> EngineResult<Supersession> {
        if new_content.trim().is_empty() {
            return Err(EngineError::Invalid("memory content is empty".into()));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old = load_memory(&tx, old_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {old_id}")))?;
        if !old.is_current() {
            return Err(EngineError::Conflict(format!(
                "memory {old_id} is no longer current (superseded or deleted)"
            )));
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let tags = serde_json::to_string(&old.tags)?;
        let blob = embedding.map(f32_vec_to_bytes);

        tx.execute(
            "INSERT INTO memories (id, user_id, app_id, content, embedding, tags, state,
                                   created_at, valid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![new_id, old.user_id, old.app_id, new_content, blob, tags, old.state.as_str(), now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO memory_categories (memory_id, category_id)
             SELECT ?1, category_id FROM memory_categories WHERE memory_id = ?2",
            params![new_id, old_id],
        )?;
        if self.fts_available {
            tx.execute(
                "INSERT INTO memories_fts (id, user_id, content) VALUES (?1, ?2, ?3)",
                params![new_id, old.user_id, new_content],
            )?;
        }
        let closed = tx.execute(
            "UPDATE memories SET invalid_at = ?2, superseded_by = ?3, updated_at = ?2
             WHERE id = ?1 AND invalid_at IS NULL",
            params![old_id, now, new_id],
        )?;
        if closed != 1 {
            return Err(EngineError::Conflict(format!("memory {old_id} was superseded concurrently")));
        }
        tx.commit()?;

        info!("[store] Memory {} superseded by {}", old_id, new_id);
        Ok(Supersession { new_id, previous_content: old.content })
    }

    /// Mark a memory deleted and close its validity interval. Returns the
    /// content it held.
    pub fn mark_memory_deleted(&self, id: &str) -> EngineResult<String> {
        let conn = self.conn.lock();
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT content, state FROM memories WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (content, state) = current.ok_or_else(|| EngineError::NotFound(format!("memory {id}")))?;
        if MemoryState::parse(&state) == MemoryState::Deleted {
            return Err(EngineError::Conflict(format!("memory {id} is already deleted")));
        }
        let now = now_ts();
        conn.execute(
            "UPDATE memories SET state = 'deleted', invalid_at = COALESCE(invalid_at, ?2),
                                 updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(content)
    }

    /// Change lifecycle state (pause/archive/reactivate). Deletion goes
    /// through `mark_memory_deleted`.
    pub fn set_memory_state(&self, id: &str, state: MemoryState) -> EngineResult<()> {
        if state == MemoryState::Deleted {
            return Err(EngineError::Invalid("use mark_memory_deleted to delete".into()));
        }
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE memories SET state = ?2, updated_at = ?3 WHERE id = ?1 AND state != 'deleted'",
            params![id, state.as_str(), now_ts()],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("live memory {id}")));
        }
        Ok(())
    }

    /// Every version of a memory, oldest first, given any id in the chain.
    pub fn version_chain(&self, id: &str) -> EngineResult<Vec<Memory>> {
        let conn = self.conn.lock();
        let mut seen = HashSet::new();

        let mut root = id.to_string();
        seen.insert(root.clone());
        while let Some(prev) = conn
            .query_row(
                "SELECT id FROM memories WHERE superseded_by = ?1",
                params![root],
                |r| r.get::<_, String>(0),
            )
            .optional()?
        {
            if !seen.insert(prev.clone()) {
                break;
            }
            root = prev;
        }

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(root);
        while let Some(cur) = cursor.take() {
            if !visited.insert(cur.clone()) {
                break;
            }
            if let Some(mem) = load_memory(&conn, &cur)? {
                cursor = mem.superseded_by.clone();
                chain.push(mem);
            }
        }
        Ok(chain)
    }

    // ── Search arms ────────────────────────────────────────────────────

    /// BM25 full-text arm over live memories of one user.
    pub fn search_text_ids(&self, user_id: &str, query: &str, limit: usize) -> EngineResult<Vec<String>> {
        if !self.fts_available {
            return Err(EngineError::Unsupported("full-text index (FTS5) not available".into()));
        }
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id
             FROM memories_fts f
             JOIN memories m ON m.id = f.id
             WHERE memories_fts MATCH ?1
               AND m.user_id = ?2
               AND m.invalid_at IS NULL
               AND m.state != 'deleted'
             ORDER BY f.rank, m.created_at DESC
             LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![expr, user_id, limit as i64], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Cosine-similarity arm over live memories of one user that carry an embedding.
    pub fn search_vector_ids(&self, user_id: &str, query: &[f32], limit: usize) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM memories
             WHERE user_id = ?1
               AND embedding IS NOT NULL
               AND invalid_at IS NULL
               AND state != 'deleted'
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut scored: Vec<(String, f64)> = rows
            .into_iter()
            .map(|(id, blob)| {
                let sim = cosine_similarity(query, &bytes_to_f32_vec(&blob));
                (id, sim)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    /// Fetch all `ids` in one statement via a JSON set parameter.
    pub fn hydrate_memories(&self, user_id: &str, ids: &[String]) -> EngineResult<Vec<HydratedMemory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_set = serde_json::to_string(ids)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.user_id, m.content, m.created_at, m.valid_at, m.state, m.tags,
                    a.name,
                    (SELECT json_group_array(c.name) FROM memory_categories mc
                       JOIN categories c ON c.id = mc.category_id
                      WHERE mc.memory_id = m.id)
             FROM memories m
             LEFT JOIN apps a ON a.id = m.app_id
             WHERE m.id IN (SELECT value FROM json_each(?1))
               AND m.user_id = ?2
               AND m.invalid_at IS NULL
               AND m.state != 'deleted'",
        )?;
        let rows = stmt
            .query_map(params![id_set, user_id], |r| {
                let created_at: String = r.get(3)?;
                let valid_at: String = r.get(4)?;
                let state: String = r.get(5)?;
                Ok(HydratedMemory {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    content: r.get(2)?,
                    created_at: ts_col(&created_at),
                    valid_at: ts_col(&valid_at),
                    state: MemoryState::parse(&state),
                    tags: json_list(r.get(6)?),
                    app_name: r.get(7)?,
                    categories: json_list(r.get(8)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl SearchBackend for GraphStore {
    async fn text_search(&self, user_id: &str, query: &str, limit: usize) -> EngineResult<Vec<String>> {
        self.search_text_ids(user_id, query, limit)
    }

    async fn vector_search(&self, user_id: &str, embedding: &[f32], limit: usize) -> EngineResult<Vec<String>> {
        self.search_vector_ids(user_id, embedding, limit)
    }

    async fn hydrate(&self, user_id: &str, ids: &[String]) -> EngineResult<Vec<HydratedMemory>> {
        self.hydrate_memories(user_id, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user() -> GraphStore {
        let store = GraphStore::open_in_memory().unwrap();
        store.ensure_user("u1", "Ada").unwrap();
        store
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

    #[test]
    fn test_fts_match_expr() {
        assert_eq!(fts_match_expr("rust, async!").unwrap(), "\"rust\" OR \"async\"");
        assert!(fts_match_expr("  ?? ").is_none());
    }

    #[test]
    fn test_insert_and_get_memory() {
        let store = store_with_user();
        let id = store.insert_memory(&new_memory("likes green tea"), None).unwrap();
        let mem = store.get_memory(&id).unwrap().unwrap();
        assert_eq!(mem.content, "likes green tea");
        assert_eq!(mem.categories, vec!["work".to_string()]);
        assert_eq!(mem.tags, vec!["t1".to_string()]);
        assert_eq!(mem.extraction_status, ExtractionStatus::Absent);
        assert!(mem.is_current());
    }

    #[test]
    fn test_text_search_excludes_superseded() {
        let store = store_with_user();
        let id = store.insert_memory(&new_memory("prefers vim keybindings"), None).unwrap();
        assert_eq!(store.search_text_ids("u1", "vim", 10).unwrap(), vec![id.clone()]);

        let sup = store.supersede_memory(&id, "prefers emacs keybindings", None).unwrap();
        assert!(store.search_text_ids("u1", "vim", 10).unwrap().is_empty());
        assert_eq!(store.search_text_ids("u1", "keybindings", 10).unwrap(), vec![sup.new_id]);
    }

    #[test]
    fn test_vector_search_orders_by_cosine() {
        let store = store_with_user();
        let a = store.insert_memory(&new_memory("a"), Some(&[1.0, 0.0])).unwrap();
        let b = store.insert_memory(&new_memory("b"), Some(&[0.6, 0.8])).unwrap();
        let _none = store.insert_memory(&new_memory("no embedding"), None).unwrap();
        let ids = store.search_vector_ids("u1", &[0.0, 1.0], 10).unwrap();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn test_vector_search_surfaces_undecodable_rows() {
        let store = store_with_user();
        let a = store.insert_memory(&new_memory("a"), Some(&[1.0, 0.0])).unwrap();
        store.insert_memory(&new_memory("b"), Some(&[0.6, 0.8])).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE memories SET embedding = 'not a blob' WHERE id = ?1", params![a])
            .unwrap();
        assert!(store.search_vector_ids("u1", &[0.0, 1.0], 10).is_err());
    }

    #[test]
    fn test_hydrate_joins_app_and_skips_deleted() {
        let store = store_with_user();
        let app = store.ensure_app("u1", "notes").unwrap();
        let mut m = new_memory("first");
        m.app_id = Some(app.clone());
        let a = store.insert_memory(&m, None).unwrap();
        let b = store.insert_memory(&new_memory("second"), None).unwrap();
        store.mark_memory_deleted(&b).unwrap();

        let rows = store.hydrate_memories("u1", &[a.clone(), b, "missing".into()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);
        assert_eq!(rows[0].app_name.as_deref(), Some("notes"));
        assert_eq!(rows[0].categories, vec!["work".to_string()]);
        assert_eq!(store.ensure_app("u1", "notes").unwrap(), app);
    }

    #[test]
    fn test_supersede_twice_is_conflict_and_chain_is_ordered() {
        let store = store_with_user();
        let v1 = store.insert_memory(&new_memory("v1"), None).unwrap();
        let v2 = store.supersede_memory(&v1, "v2", None).unwrap().new_id;
        let v3 = store.supersede_memory(&v2, "v3", None).unwrap().new_id;

        let err = store.supersede_memory(&v1, "again", None).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let chain: Vec<String> = store.version_chain(&v2).unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(chain, vec!["v1", "v2", "v3"]);

        let old = store.get_memory(&v1).unwrap().unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(v2.as_str()));
        assert!(old.invalid_at.is_some());
        let newest = store.get_memory(&v3).unwrap().unwrap();
        assert_eq!(newest.categories, vec!["work".to_string()]);
    }

    #[test]
    fn test_set_memory_state() {
        let store = store_with_user();
        let id = store.insert_memory(&new_memory("x"), None).unwrap();
        store.set_memory_state(&id, MemoryState::Paused).unwrap();
        assert_eq!(store.get_memory(&id).unwrap().unwrap().state, MemoryState::Paused);
        assert!(store.set_memory_state(&id, MemoryState::Deleted).is_err());
    }
}
