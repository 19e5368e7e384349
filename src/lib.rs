// factgraph: hybrid recall and knowledge-graph ingestion for a personal
// memory store.
//
//   atoms   pure types, configuration, errors and boundary traits
//   engine  SQLite graph store, model providers, and the recall core

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::recall_types::{
    HydratedMemory, RankedCandidate, RecallConfig, RerankMode, SearchMode, SearchOptions,
    SearchResult,
};
pub use atoms::traits::{Embedder, EntityStore, ExtractionStore, HistoryStore, LlmClient, SearchBackend};
pub use engine::limiter::ConcurrencyLimiter;
pub use engine::providers::{EmbeddingClient, OpenAiChatClient};
pub use engine::recall::{
    EntityExtractionWorker, EntityResolver, ExtractionOutcome, ExtractionQueue, HybridSearch,
    MemoryHistoryLedger, MemoryVersioning, QueueConfig,
};
pub use engine::session_manager::SessionManager;
pub use engine::store::GraphStore;
