// ── factgraph Atoms: Data Model ────────────────────────────────────────────
// Memories, entities and history records as they cross the store boundary.
// Pure data + pure helpers; no I/O.

use crate::atoms::constants::TIMESTAMP_FORMAT;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════
// Timestamps
// ═══════════════════════════════════════════════════════════════════════════

/// Format a UTC instant for storage (microsecond precision, sortable).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts the storage format and plain RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a memory, independent of its bitemporal interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    #[default]
    Active,
    Paused,
    Archived,
    Deleted,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryState::Active => "active",
            MemoryState::Paused => "paused",
            MemoryState::Archived => "archived",
            MemoryState::Deleted => "deleted",
        }
    }

    /// Unknown values map to `Active`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "paused" => MemoryState::Paused,
            "archived" => MemoryState::Archived,
            "deleted" => MemoryState::Deleted,
            _ => MemoryState::Active,
        }
    }
}

/// Entity-extraction progress recorded on the memory node.
///
/// `Absent | Failed → Pending → Done | Failed`. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    #[default]
    Absent,
    Pending,
    Done,
    Failed,
}

impl ExtractionStatus {
    /// Stored column value. `Absent` is stored as NULL.
    pub fn as_db(&self) -> Option<&'static str> {
        match self {
            ExtractionStatus::Absent => None,
            ExtractionStatus::Pending => Some("pending"),
            ExtractionStatus::Done => Some("done"),
            ExtractionStatus::Failed => Some("failed"),
        }
    }

    pub fn from_db(raw: Option<&str>) -> Self {
        match raw {
            Some("pending") => ExtractionStatus::Pending,
            Some("done") => ExtractionStatus::Done,
            Some("failed") => ExtractionStatus::Failed,
            _ => ExtractionStatus::Absent,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtractionStatus::Done)
    }
}

/// A memory node. Content is immutable; edits create a new node (supersession).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub app_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub valid_at: DateTime<Utc>,
    /// Set when a newer version replaced this one (or it was deleted).
    pub invalid_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
    pub state: MemoryState,
    pub extraction_status: ExtractionStatus,
    pub extraction_attempts: u32,
    pub extraction_error: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

impl Memory {
    /// Whether this version is the live one (not superseded, not deleted).
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none() && self.state != MemoryState::Deleted
    }
}

/// Input for creating a memory node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMemory {
    pub user_id: String,
    pub app_id: Option<String>,
    pub content: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

/// What the extraction worker needs to know about a memory before running.
#[derive(Debug, Clone)]
pub struct ExtractionTarget {
    pub memory_id: String,
    pub content: String,
    pub status: ExtractionStatus,
    /// Owning user, resolved through the owner edge. `None` if the edge or
    /// the user node is missing.
    pub user_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════

/// Normalize an entity name for identity comparison:
/// lowercase, strip whitespace, hyphens, underscores, slashes and dots.
pub fn normalize_entity_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '_' | '/' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Normalize an entity type: trimmed, lowercase. Empty becomes "unknown".
pub fn normalize_entity_type(entity_type: &str) -> String {
    let t = entity_type.trim().to_lowercase();
    if t.is_empty() {
        "unknown".to_string()
    } else {
        t
    }
}

/// A persisted entity, scoped to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// An entity mention produced by extraction, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

impl EntityCandidate {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: description.into(),
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_entity_name(&self.name)
    }

    pub fn normalized_type(&self) -> String {
        normalize_entity_type(&self.entity_type)
    }

    /// Identity key within one user's graph: (normalized name, type).
    pub fn key(&self) -> EntityKey {
        EntityKey {
            normalized_name: self.normalized_name(),
            entity_type: self.normalized_type(),
        }
    }
}

/// Identity of an entity within one user's graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub normalized_name: String,
    pub entity_type: String,
}

/// Input for the atomic create-or-merge upsert.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub key: EntityKey,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
}

/// Result of an upsert: the surviving id and whether this call created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpsert {
    pub id: String,
    pub created: bool,
}

/// A directed relation between two extracted entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryAction {
    Add,
    Update,
    Delete,
    None,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Add => "ADD",
            HistoryAction::Update => "UPDATE",
            HistoryAction::Delete => "DELETE",
            HistoryAction::None => "NONE",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ADD" => HistoryAction::Add,
            "UPDATE" => HistoryAction::Update,
            "DELETE" => HistoryAction::Delete,
            _ => HistoryAction::None,
        }
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub memory_id: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub action: HistoryAction,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

/// Input for `MemoryHistoryLedger::add_history`.
#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub memory_id: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub action: HistoryAction,
    /// Defaults to now when omitted.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl NewHistoryRecord {
    pub fn new(memory_id: impl Into<String>, action: HistoryAction) -> Self {
        Self {
            memory_id: memory_id.into(),
            previous_value: None,
            new_value: None,
            action,
            created_at: None,
            updated_at: None,
            is_deleted: false,
        }
    }

    pub fn previous(mut self, value: impl Into<String>) -> Self {
        self.previous_value = Some(value.into());
        self
    }

    pub fn new_value(mut self, value: impl Into<String>) -> Self {
        self.new_value = Some(value.into());
        self
    }

    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
