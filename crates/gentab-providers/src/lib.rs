//! Uniform contracts for the external model-serving providers: chat
//! completion (single-shot and streamed), embeddings, reranking, code
//! interpreters and image generation. The engine orchestrates through
//! these traits and never sees any single provider's wire format.

pub mod http;
pub mod mock;
pub mod types;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use gentab_core::Result;
use types::{ChatCompletion, ChatRequest, StreamDelta};

/// A cancellable, ordered, finite-but-unbounded sequence of completion
/// deltas. Dropping the stream propagates cancellation to the in-flight
/// provider call.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion>;
    async fn stream(&self, req: ChatRequest) -> Result<ChatStream>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier for the provider/model (e.g., `http:bge-m3:d1024`).
    fn embedder_id(&self) -> &str;
    /// Embedding dimensionality (D).
    fn dim(&self) -> usize;
    /// Compute embeddings for a batch of input texts. Vectors are returned
    /// un-normalized.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait RerankProvider: Send + Sync {
    /// Relevance-ordered `(candidate_index, score)` pairs for the given
    /// query over candidate texts.
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<(usize, f32)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLanguage {
    Generic,
    Python,
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn run(&self, language: CodeLanguage, source: &str) -> Result<String>;
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Returns a URI for the generated image.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
}
