// Database schema and migrations for the graph store.
// Called once by GraphStore::open*() after WAL is enabled.
// Adding a table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN (errors swallowed) at the end of
// run_migrations(). Never modify existing SQL.

use crate::atoms::error::EngineResult;
use log::{info, warn};
use rusqlite::Connection;

const GRAPH_SCHEMA: &str = "
    -- ── Memory graph ────────────────────────────────────────────────────
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (user_id, name)
    );

    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        app_id TEXT,
        content TEXT NOT NULL,
        embedding BLOB,
        tags TEXT NOT NULL DEFAULT '[]',
        state TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT,
        valid_at TEXT NOT NULL,
        invalid_at TEXT,
        superseded_by TEXT,
        extraction_status TEXT,
        extraction_attempts INTEGER NOT NULL DEFAULT 0,
        extraction_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_memories_user_live
        ON memories(user_id, invalid_at, state);
    CREATE INDEX IF NOT EXISTS idx_memories_superseded_by
        ON memories(superseded_by);

    CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS memory_categories (
        memory_id TEXT NOT NULL,
        category_id TEXT NOT NULL,
        PRIMARY KEY (memory_id, category_id)
    );

    -- ── Knowledge graph ─────────────────────────────────────────────────
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        UNIQUE (user_id, entity_type, normalized_name)
    );

    CREATE TABLE IF NOT EXISTS entity_aliases (
        entity_id TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (entity_id, normalized_name)
    );

    CREATE INDEX IF NOT EXISTS idx_entity_aliases_name
        ON entity_aliases(normalized_name);

    CREATE TABLE IF NOT EXISTS entity_relations (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        relation_type TEXT NOT NULL DEFAULT 'RELATED_TO',
        description TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT,
        UNIQUE (source_id, target_id, relation_type)
    );

    CREATE TABLE IF NOT EXISTS memory_entities (
        memory_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (memory_id, entity_id)
    );

    CREATE INDEX IF NOT EXISTS idx_memory_entities_entity
        ON memory_entities(entity_id);

    -- ── Audit ledger ────────────────────────────────────────────────────
    CREATE TABLE IF NOT EXISTS memory_history (
        id TEXT PRIMARY KEY,
        memory_id TEXT NOT NULL,
        previous_value TEXT,
        new_value TEXT,
        action TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_memory_history_memory
        ON memory_history(memory_id, created_at DESC);
";

const FTS_SCHEMA: &str = "
    CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
        id UNINDEXED,
        user_id UNINDEXED,
        content
    );
";

/// Create every table. Returns whether the FTS5 index is available.
pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<bool> {
    info!("[store] Running graph schema migrations");
    conn.execute_batch(GRAPH_SCHEMA)?;

    let fts_available = match conn.execute_batch(FTS_SCHEMA) {
        Ok(()) => true,
        Err(e) => {
            warn!("[store] FTS5 unavailable, text search disabled: {}", e);
            false
        }
    };

    Ok(fts_available)
}
