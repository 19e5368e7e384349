// ── factgraph Atoms: Constants ─────────────────────────────────────────────
// Named constants shared across the recall core. Tunable values are
// mirrored as defaults in `atoms::types::RecallConfig`.

// ── Rank fusion ────────────────────────────────────────────────────────────
/// RRF constant (k=60 is standard in information retrieval).
pub const RRF_K: f64 = 60.0;

// ── Search defaults ────────────────────────────────────────────────────────
pub const DEFAULT_TOP_K: usize = 10;
/// Per-arm candidate cap before fusion.
pub const DEFAULT_CANDIDATE_SIZE: usize = 50;

// ── Reranking ──────────────────────────────────────────────────────────────
/// Simultaneous cross-encoder scoring calls.
pub const CROSS_ENCODER_CONCURRENCY: usize = 5;
pub const CROSS_ENCODER_MAX_SCORE: i64 = 10;
/// MMR λ: 1.0 = pure relevance, 0.0 = pure diversity.
pub const DEFAULT_MMR_LAMBDA: f64 = 0.7;

// ── Entity resolution ─────────────────────────────────────────────────────
/// Jaro–Winkler similarity over normalized names for a tier-2 fuzzy match.
pub const FUZZY_NAME_THRESHOLD: f64 = 0.92;
/// Normalized names shorter than this never fuzzy-match ("ai" vs "ui").
pub const FUZZY_MIN_NAME_LEN: usize = 4;
/// Cosine similarity for an outright tier-3 semantic match.
pub const SEMANTIC_MATCH_THRESHOLD: f64 = 0.90;
/// Below the match threshold but above this floor, ask the LLM judge.
pub const SEMANTIC_JUDGE_FLOOR: f64 = 0.75;

// ── Extraction ─────────────────────────────────────────────────────────────
pub const EXTRACTION_CONCURRENCY: usize = 4;
pub const EXTRACTION_MAX_ATTEMPTS: u32 = 3;
pub const EXTRACTION_RETRY_BASE_MS: u64 = 500;

// ── History ────────────────────────────────────────────────────────────────
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

// ── Timestamps ─────────────────────────────────────────────────────────────
/// RFC 3339 with microseconds; lexicographic order == chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
