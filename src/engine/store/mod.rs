// factgraph Engine: Graph Store
// The fact store backed by SQLite via rusqlite. Memories, users, apps and
// categories form the memory graph; entities, aliases and RELATED_TO edges form
// the knowledge graph; memory_history is the append-only audit ledger.
//
// Module layout:
//   schema      idempotent migrations, FTS5 detection
//   embedding   bytes_to_f32_vec, f32_vec_to_bytes, cosine_similarity
//   memories    users/apps, memory writes, supersession, search arms, hydration
//   entities    entity lookup + atomic upsert, aliases, relations
//   extraction  extraction status bookkeeping, memory→entity links
//   history     history ledger rows
//
// Every store trait in `atoms::traits` is implemented here. Trait methods
// lock the connection synchronously and never hold it across an `.await`.

use crate::atoms::error::EngineResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

pub(crate) mod embedding;
mod entities;
mod extraction;
mod history;
mod memories;
mod schema;

pub use embedding::{cosine_similarity, f32_vec_to_bytes};

/// Thread-safe database wrapper.
pub struct GraphStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need to poke rows directly.
    pub conn: Mutex<Connection>,
    /// Whether the FTS5 index exists; the text arm is unavailable otherwise.
    fts_available: bool,
}

impl GraphStore {
    /// Open (or create) a database file and initialize tables.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        info!("[store] Opening graph store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA busy_timeout = 5000;").ok();
        Self::from_connection(conn)
    }

    /// Fresh in-memory database, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        let fts_available = schema::run_migrations(&conn)?;
        Ok(GraphStore { conn: Mutex::new(conn), fts_available })
    }

    /// Whether the full-text arm can run against this store.
    pub fn fts_available(&self) -> bool {
        self.fts_available
    }
}

/// Current time in storage format.
pub(crate) fn now_ts() -> String {
    crate::atoms::types::format_timestamp(&chrono::Utc::now())
}

/// Parse a stored timestamp column, falling back to the epoch on garbage.
pub(crate) fn ts_col(raw: &str) -> chrono::DateTime<chrono::Utc> {
    crate::atoms::types::parse_timestamp(raw).unwrap_or_default()
}
