// factgraph Engine: Model Providers
// Concrete implementations of the `LlmClient` and `Embedder` boundary traits.
// Anything else that speaks those traits (a local model, a test double) plugs
// into the recall core the same way.

pub mod embedding;
pub mod openai;

pub use embedding::EmbeddingClient;
pub use openai::OpenAiChatClient;
