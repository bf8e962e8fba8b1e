//! Deterministic in-process providers for offline runs and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use gentab_core::{Error, Result};

use crate::types::{ChatCompletion, ChatRequest, FinishReason, Role, StreamDelta, Usage};
use crate::{
    ChatProvider, ChatStream, CodeLanguage, EmbeddingProvider, ImageProvider, Interpreter,
    RerankProvider,
};

/// Hashing embedder: stable pseudo-embeddings derived from token hashes.
/// No model weights required, same text always maps to the same vector.
pub struct HashEmbedder {
    id: String,
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { id: format!("fake:xxhash:d{dim}"), dim }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
            v[idx] += val + (i as f32 % 3.0) * 0.01;
        }
        let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn embedder_id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Streams a scripted chunk sequence, optionally failing partway through.
/// Records every request it sees so tests can inspect reconstructed
/// message histories.
pub struct ScriptedChat {
    chunks: Vec<String>,
    fail_after: Option<usize>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(str::to_string).collect(),
            fail_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail with a provider error after emitting `n` chunks.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn record(&self, req: &ChatRequest) {
        self.requests.lock().expect("requests lock").push(req.clone());
    }

    fn usage(&self) -> Usage {
        let completion: usize = self.chunks.iter().map(|c| c.split_whitespace().count()).sum();
        Usage { prompt_tokens: 7, completion_tokens: completion as u32 }
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion> {
        self.record(&req);
        if self.fail_after.is_some() {
            return Err(Error::provider("scripted failure"));
        }
        Ok(ChatCompletion {
            content: self.chunks.concat(),
            finish_reason: FinishReason::Stop,
            usage: Some(self.usage()),
        })
    }

    async fn stream(&self, req: ChatRequest) -> Result<ChatStream> {
        self.record(&req);
        let mut items: Vec<Result<StreamDelta>> = Vec::new();
        match self.fail_after {
            Some(n) => {
                for chunk in self.chunks.iter().take(n) {
                    items.push(Ok(StreamDelta::content(chunk.clone())));
                }
                items.push(Err(Error::provider("scripted mid-stream failure")));
            }
            None => {
                for chunk in &self.chunks {
                    items.push(Ok(StreamDelta::content(chunk.clone())));
                }
                items.push(Ok(StreamDelta::finished(FinishReason::Stop, Some(self.usage()))));
            }
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Streams the last user message back word by word. Handy for offline CLI
/// runs.
pub struct EchoChat;

fn last_user_text(req: &ChatRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl ChatProvider for EchoChat {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion> {
        let text = last_user_text(&req);
        let tokens = text.split_whitespace().count() as u32;
        Ok(ChatCompletion {
            content: text,
            finish_reason: FinishReason::Stop,
            usage: Some(Usage { prompt_tokens: tokens, completion_tokens: tokens }),
        })
    }

    async fn stream(&self, req: ChatRequest) -> Result<ChatStream> {
        let text = last_user_text(&req);
        let mut items: Vec<Result<StreamDelta>> = text
            .split_whitespace()
            .map(|w| Ok(StreamDelta::content(format!("{w} "))))
            .collect();
        let tokens = text.split_whitespace().count() as u32;
        items.push(Ok(StreamDelta::finished(
            FinishReason::Stop,
            Some(Usage { prompt_tokens: tokens, completion_tokens: tokens }),
        )));
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Keyword-overlap reranker: scores each candidate by the fraction of
/// query words it contains.
pub struct OverlapReranker;

#[async_trait]
impl RerankProvider for OverlapReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<(usize, f32)>> {
        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        let mut scored: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let content_lower = text.to_lowercase();
                let mut hits = 0.0f32;
                for word in &query_words {
                    if content_lower.contains(word) {
                        hits += 1.0;
                    }
                }
                (i, hits / query_words.len().max(1) as f32)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored)
    }
}

/// Interpreter that evaluates nothing and returns its input; tests assert
/// value flow, not language semantics.
pub struct EchoInterpreter;

#[async_trait]
impl Interpreter for EchoInterpreter {
    async fn run(&self, _language: CodeLanguage, source: &str) -> Result<String> {
        Ok(source.to_string())
    }
}

/// Image provider returning a deterministic placeholder URI.
pub struct StaticImage;

#[async_trait]
impl ImageProvider for StaticImage {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut hasher = XxHash64::with_seed(7);
        model.hash(&mut hasher);
        prompt.hash(&mut hasher);
        Ok(format!("mock://image/{:x}", hasher.finish()))
    }
}

/// All message contents with roles, for history assertions in tests.
pub fn transcript(req: &ChatRequest) -> Vec<(Role, String)> {
    req.messages.iter().map(|m| (m.role, m.content.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use futures::StreamExt;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_batch(&["hello world".into()]).await.unwrap();
        let b = e.embed_batch(&["hello world".into()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn scripted_chat_fails_midway_when_asked() {
        let chat = ScriptedChat::new(vec!["a", "b", "c", "d", "e"]).failing_after(2);
        let mut s = chat
            .stream(ChatRequest::new("m", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        let mut ok = 0;
        let mut failed = false;
        while let Some(item) = s.next().await {
            match item {
                Ok(_) => ok += 1,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert_eq!(ok, 2);
        assert!(failed);
    }

    #[tokio::test]
    async fn overlap_reranker_prefers_matching_candidates() {
        let r = OverlapReranker;
        let out = r
            .rerank(
                "solar panel output",
                &[
                    "cooking with cast iron".to_string(),
                    "sizing a solar panel array for steady output".to_string(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(out[0].0, 1);
        assert!(out[0].1 > out[1].1);
    }
}
