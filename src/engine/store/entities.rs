// ── Graph Store: Entities ────────────────────────────────────────────────────
//
// Per-user entity nodes keyed by (user_id, entity_type, normalized_name),
// alias rows learned from fuzzy/semantic matches, and RELATED_TO edges.
// Create-or-merge is one atomic `INSERT … ON CONFLICT DO UPDATE … RETURNING`,
// so concurrent writers racing on a brand-new key converge on one row.

use super::embedding::{bytes_to_f32_vec, f32_vec_to_bytes};
use super::{now_ts, ts_col, GraphStore};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::EntityStore;
use crate::atoms::types::{Entity, EntityKey, EntityUpsert, NewEntity};
use async_trait::async_trait;
use log::debug;
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

/// A stored RELATED_TO edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRelation {
    pub source_id: String,
    pub target_id: String,
    pub description: String,
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let created_at: String = row.get(6)?;
    let updated_at: Option<String> = row.get(7)?;
    let blob: Option<Vec<u8>> = row.get(8)?;
    Ok(Entity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        normalized_name: row.get(3)?,
        entity_type: row.get(4)?,
        description: row.get(5)?,
        created_at: ts_col(&created_at),
        updated_at: updated_at.as_deref().map(ts_col),
        embedding: blob.map(|b| bytes_to_f32_vec(&b)),
    })
}

const ENTITY_COLUMNS: &str = "id, user_id, name, normalized_name, entity_type, description,
     created_at, updated_at, embedding";

impl GraphStore {
    /// Batch exact lookup: one statement for all keys.
    pub fn find_entities_exact(
        &self,
        user_id: &str,
        keys: &[EntityKey],
    ) -> EngineResult<HashMap<EntityKey, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let key_set = serde_json::to_string(
            &keys
                .iter()
                .map(|k| json!({ "n": k.normalized_name, "t": k.entity_type }))
                .collect::<Vec<_>>(),
        )?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.normalized_name, e.entity_type
             FROM entities e
             JOIN json_each(?2) k
               ON e.normalized_name = json_extract(k.value, '$.n')
              AND e.entity_type = json_extract(k.value, '$.t')
             WHERE e.user_id = ?1",
        )?;
        let hits = stmt
            .query_map(params![user_id, key_set], |r| {
                Ok((
                    EntityKey { normalized_name: r.get(1)?, entity_type: r.get(2)? },
                    r.get::<_, String>(0)?,
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(hits)
    }

    pub fn find_entity_by_alias(&self, user_id: &str, key: &EntityKey) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT e.id FROM entity_aliases a
                 JOIN entities e ON e.id = a.entity_id
                 WHERE e.user_id = ?1 AND e.entity_type = ?2 AND a.normalized_name = ?3
                 ORDER BY a.created_at
                 LIMIT 1",
                params![user_id, key.entity_type, key.normalized_name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn list_entities_of_type(&self, user_id: &str, entity_type: &str) -> EngineResult<Vec<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE user_id = ?1 AND entity_type = ?2
             ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(params![user_id, entity_type], entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_entity(&self, entity_id: &str) -> EngineResult<Option<Entity>> {
        let conn = self.conn.lock();
        let e = conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
                params![entity_id],
                entity_from_row,
            )
            .optional()?;
        Ok(e)
    }

    /// Number of entities a user owns.
    pub fn count_entities(&self, user_id: &str) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Atomic create-or-merge. Existing rows keep their id and name; the
    /// description is replaced only by a strictly longer one.
    pub fn upsert_entity_row(&self, user_id: &str, entity: &NewEntity) -> EngineResult<EntityUpsert> {
        let new_id = uuid::Uuid::new_v4().to_string();
        let blob = entity.embedding.as_deref().map(f32_vec_to_bytes);
        let conn = self.conn.lock();
        let id: String = conn.query_row(
            "INSERT INTO entities (id, user_id, name, normalized_name, entity_type, description,
                                   embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id, entity_type, normalized_name) DO UPDATE SET
                 description = CASE WHEN length(excluded.description) > length(entities.description)
                                    THEN excluded.description ELSE entities.description END,
                 updated_at  = CASE WHEN length(excluded.description) > length(entities.description)
                                    THEN excluded.created_at ELSE entities.updated_at END,
                 embedding   = COALESCE(entities.embedding, excluded.embedding)
             RETURNING id",
            params![
                new_id,
                user_id,
                entity.name,
                entity.key.normalized_name,
                entity.key.entity_type,
                entity.description,
                blob,
                now_ts()
            ],
            |r| r.get(0),
        )?;
        let created = id == new_id;
        debug!(
            "[store] Upsert entity '{}' ({}) → {} (created={})",
            entity.name, entity.key.entity_type, id, created
        );
        Ok(EntityUpsert { id, created })
    }

    /// Conditional write: only a strictly longer description replaces the old.
    pub fn update_entity_description_if_longer(&self, entity_id: &str, description: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE entities SET description = ?2, updated_at = ?3
             WHERE id = ?1 AND length(?2) > length(description)",
            params![entity_id, description, now_ts()],
        )?;
        Ok(n > 0)
    }

    pub fn add_entity_alias(&self, entity_id: &str, key: &EntityKey) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO entity_aliases (entity_id, normalized_name, created_at)
             SELECT ?1, ?2, ?3 WHERE NOT EXISTS (
                 SELECT 1 FROM entities WHERE id = ?1 AND normalized_name = ?2)",
            params![entity_id, key.normalized_name, now_ts()],
        )?;
        Ok(())
    }

    pub fn entity_aliases(&self, entity_id: &str) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT normalized_name FROM entity_aliases WHERE entity_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Idempotent RELATED_TO edge; a longer description replaces a shorter one.
    pub fn relate_entity_rows(&self, source_id: &str, target_id: &str, description: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entity_relations (id, source_id, target_id, relation_type, description, created_at)
             VALUES (?1, ?2, ?3, 'RELATED_TO', ?4, ?5)
             ON CONFLICT (source_id, target_id, relation_type) DO UPDATE SET
                 description = excluded.description,
                 updated_at = excluded.created_at
             WHERE length(excluded.description) > length(entity_relations.description)",
            params![uuid::Uuid::new_v4().to_string(), source_id, target_id, description, now_ts()],
        )?;
        Ok(())
    }

    /// Outgoing RELATED_TO edges of an entity.
    pub fn relations_from(&self, source_id: &str) -> EngineResult<Vec<EntityRelation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, description FROM entity_relations
             WHERE source_id = ?1 AND relation_type = 'RELATED_TO'
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![source_id], |r| {
                Ok(EntityRelation {
                    source_id: r.get(0)?,
                    target_id: r.get(1)?,
                    description: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl EntityStore for GraphStore {
    async fn find_exact(&self, user_id: &str, keys: &[EntityKey]) -> EngineResult<HashMap<EntityKey, String>> {
        self.find_entities_exact(user_id, keys)
    }

    async fn find_by_alias(&self, user_id: &str, key: &EntityKey) -> EngineResult<Option<String>> {
        self.find_entity_by_alias(user_id, key)
    }

    async fn list_entities(&self, user_id: &str, entity_type: &str) -> EngineResult<Vec<Entity>> {
        self.list_entities_of_type(user_id, entity_type)
    }

    async fn upsert_entity(&self, user_id: &str, entity: &NewEntity) -> EngineResult<EntityUpsert> {
        self.upsert_entity_row(user_id, entity)
    }

    async fn update_description_if_longer(&self, entity_id: &str, description: &str) -> EngineResult<bool> {
        self.update_entity_description_if_longer(entity_id, description)
    }

    async fn add_alias(&self, entity_id: &str, key: &EntityKey) -> EngineResult<()> {
        self.add_entity_alias(entity_id, key)
    }

    async fn relate_entities(&self, source_id: &str, target_id: &str, description: &str) -> EngineResult<()> {
        self.relate_entity_rows(source_id, target_id, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, ty: &str) -> EntityKey {
        EntityKey { normalized_name: name.into(), entity_type: ty.into() }
    }

    fn new_entity(name: &str, ty: &str, desc: &str) -> NewEntity {
        NewEntity {
            name: name.into(),
            key: key(&crate::atoms::types::normalize_entity_name(name), ty),
            description: desc.into(),
            embedding: None,
        }
    }

    #[test]
    fn test_upsert_creates_then_merges() {
        let store = GraphStore::open_in_memory().unwrap();
        let first = store.upsert_entity_row("u1", &new_entity("Open AI", "org", "lab")).unwrap();
        assert!(first.created);
        let second = store.upsert_entity_row("u1", &new_entity("open-ai", "org", "AI research lab")).unwrap();
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        let e = store.get_entity(&first.id).unwrap().unwrap();
        assert_eq!(e.description, "AI research lab");
        assert_eq!(e.name, "Open AI");

        store.upsert_entity_row("u1", &new_entity("OpenAI", "org", "x")).unwrap();
        assert_eq!(store.get_entity(&first.id).unwrap().unwrap().description, "AI research lab");
        assert_eq!(store.count_entities("u1").unwrap(), 1);
    }

    #[test]
    fn test_type_is_part_of_identity() {
        let store = GraphStore::open_in_memory().unwrap();
        let a = store.upsert_entity_row("u1", &new_entity("Apple", "org", "")).unwrap();
        let b = store.upsert_entity_row("u1", &new_entity("Apple", "food", "")).unwrap();
        assert_ne!(a.id, b.id);
        let c = store.upsert_entity_row("u2", &new_entity("Apple", "org", "")).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_find_exact_batch() {
        let store = GraphStore::open_in_memory().unwrap();
        let a = store.upsert_entity_row("u1", &new_entity("Rust", "technology", "")).unwrap();
        let hits = store
            .find_entities_exact("u1", &[key("rust", "technology"), key("rust", "game"), key("go", "technology")])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits.get(&key("rust", "technology")), Some(&a.id));
    }

    #[test]
    fn test_description_update_is_conditional() {
        let store = GraphStore::open_in_memory().unwrap();
        let e = store.upsert_entity_row("u1", &new_entity("Rust", "technology", "a language")).unwrap();
        assert!(!store.update_entity_description_if_longer(&e.id, "short").unwrap());
        assert!(store.update_entity_description_if_longer(&e.id, "a systems language").unwrap());
        assert_eq!(store.get_entity(&e.id).unwrap().unwrap().description, "a systems language");
    }

    #[test]
    fn test_alias_lookup_is_type_scoped() {
        let store = GraphStore::open_in_memory().unwrap();
        let e = store.upsert_entity_row("u1", &new_entity("JavaScript", "technology", "")).unwrap();
        store.add_entity_alias(&e.id, &key("js", "technology")).unwrap();
        store.add_entity_alias(&e.id, &key("js", "technology")).unwrap();
        store.add_entity_alias(&e.id, &key("javascript", "technology")).unwrap();
        assert_eq!(store.entity_aliases(&e.id).unwrap(), vec!["js".to_string()]);
        assert_eq!(store.find_entity_by_alias("u1", &key("js", "technology")).unwrap(), Some(e.id));
        assert_eq!(store.find_entity_by_alias("u1", &key("js", "person")).unwrap(), None);
    }

    #[test]
    fn test_relations_are_idempotent_longest_wins() {
        let store = GraphStore::open_in_memory().unwrap();
        let a = store.upsert_entity_row("u1", &new_entity("Ada", "person", "")).unwrap();
        let b = store.upsert_entity_row("u1", &new_entity("Acme", "org", "")).unwrap();
        store.relate_entity_rows(&a.id, &b.id, "works at").unwrap();
        store.relate_entity_rows(&a.id, &b.id, "works at since 2020").unwrap();
        store.relate_entity_rows(&a.id, &b.id, "at").unwrap();
        let rels = store.relations_from(&a.id).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].description, "works at since 2020");
    }
}
