// ── factgraph: Recall Core ──────────────────────────────────────────────────
//
// Module layout:
//   fusion      Reciprocal Rank Fusion of the text and vector arms
//   reranking   cross-encoder (LLM scored) and MMR rerankers
//   search      HybridSearch orchestrator: arms → fuse → hydrate → rerank
//   entities    tiered EntityResolver (exact, alias/fuzzy, semantic, create)
//   extraction  EntityExtractionWorker state machine
//   queue       ExtractionQueue with retry/backoff
//   history     MemoryHistoryLedger (append-only audit trail)
//   versioning  MemoryVersioning (supersession write path)

pub mod entities;
pub mod extraction;
pub mod fusion;
pub mod history;
pub mod queue;
pub mod reranking;
pub mod search;
pub mod versioning;

pub use entities::{EntityResolver, ResolutionTier, ResolvedEntity};
pub use extraction::{EntityExtractionWorker, ExtractionOutcome, ExtractionPayload};
pub use fusion::{reciprocal_rank_fusion, SearchArm};
pub use history::MemoryHistoryLedger;
pub use queue::{ExtractionQueue, QueueConfig};
pub use reranking::{CrossEncoderReranker, MmrReranker};
pub use search::HybridSearch;
pub use versioning::MemoryVersioning;
