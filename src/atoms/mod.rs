// ── factgraph Atoms Layer ──────────────────────────────────────────────────
// Pure constants, data types, configuration, error types and boundary traits.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/.

pub mod constants;
pub mod error;
pub mod recall_types;
pub mod traits;
pub mod types;
