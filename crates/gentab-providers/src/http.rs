//! OpenAI-compatible HTTP provider: `/chat/completions` (with SSE
//! streaming), `/embeddings` and `/rerank`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use gentab_core::{Error, Result};

use crate::types::{ChatCompletion, ChatRequest, FinishReason, StreamDelta, Usage};
use crate::{ChatProvider, ChatStream, EmbeddingProvider, ImageProvider, RerankProvider};

/// Connection settings for an OpenAI-compatible endpoint, loaded from the
/// `[providers]` config table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub embed_dim: usize,
    pub rerank_model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key_env: "GENTAB_API_KEY".to_string(),
            chat_model: "default-chat".to_string(),
            embedding_model: "default-embed".to_string(),
            embed_dim: 1024,
            rerank_model: None,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        // Provider calls must convert to errors rather than hang a row
        // indefinitely.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self { http, base_url: base_url.into(), api_key }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env).ok();
        Self::new(settings.base_url.trim_end_matches('/').to_string(), api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.http.post(format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }
}

fn parse_finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    match raw {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        Some("error") => Some(FinishReason::Error),
        Some(other) => {
            debug!(finish_reason = other, "unrecognized finish_reason, treating as stop");
            Some(FinishReason::Stop)
        }
        None => None,
    }
}

#[derive(Deserialize)]
struct UsageWire {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl UsageWire {
    fn into_usage(self) -> Option<Usage> {
        Some(Usage {
            prompt_tokens: self.prompt_tokens?,
            completion_tokens: self.completion_tokens?,
        })
    }
}

#[derive(Deserialize)]
struct CompletionWire {
    choices: Vec<CompletionChoiceWire>,
    usage: Option<UsageWire>,
}

#[derive(Deserialize)]
struct CompletionChoiceWire {
    message: CompletionMessageWire,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessageWire {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunkWire {
    choices: Vec<StreamChoiceWire>,
    usage: Option<UsageWire>,
}

#[derive(Deserialize)]
struct StreamChoiceWire {
    #[serde(default)]
    delta: StreamDeltaWire,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDeltaWire {
    #[serde(default)]
    content: Option<String>,
}

/// One SSE frame payload to a delta; `[DONE]` maps to `None`.
fn parse_sse_data(data: &str) -> Result<Option<StreamDelta>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: StreamChunkWire = serde_json::from_str(data).map_err(Error::provider)?;
    let (content, finish) = chunk
        .choices
        .first()
        .map(|c| {
            (
                c.delta.content.clone().unwrap_or_default(),
                parse_finish_reason(c.finish_reason.as_deref()),
            )
        })
        .unwrap_or_default();
    Ok(Some(StreamDelta {
        content,
        finish_reason: finish,
        usage: chunk.usage.and_then(UsageWire::into_usage),
    }))
}

#[async_trait]
impl ChatProvider for OpenAiCompatClient {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion> {
        let req = ChatRequest { stream: false, ..req };
        let resp = self
            .post("/chat/completions")
            .json(&req)
            .send()
            .await
            .map_err(Error::provider)?
            .error_for_status()
            .map_err(Error::provider)?;
        let wire: CompletionWire = resp.json().await.map_err(Error::provider)?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("completion response has no choices"))?;
        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref())
                .unwrap_or(FinishReason::Stop),
            usage: wire.usage.and_then(UsageWire::into_usage),
        })
    }

    async fn stream(&self, req: ChatRequest) -> Result<ChatStream> {
        let req = ChatRequest { stream: true, ..req };
        let resp = self
            .post("/chat/completions")
            .json(&req)
            .send()
            .await
            .map_err(Error::provider)?
            .error_for_status()
            .map_err(Error::provider)?;
        let (tx, rx) = mpsc::channel::<Result<StreamDelta>>(32);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut buf = String::new();
            'outer: while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx.send(Err(Error::provider(e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&piece));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match parse_sse_data(data) {
                        Ok(Some(delta)) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                // Consumer cancelled; stop reading from the
                                // provider.
                                break 'outer;
                            }
                        }
                        Ok(None) => break 'outer,
                        Err(e) => {
                            warn!(error = %e, "malformed stream chunk");
                            let _ = tx.send(Err(e)).await;
                            break 'outer;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

pub struct HttpEmbedder {
    client: OpenAiCompatClient,
    model: String,
    id: String,
    dim: usize,
}

impl HttpEmbedder {
    pub fn new(client: OpenAiCompatClient, model: impl Into<String>, dim: usize) -> Self {
        let model = model.into();
        Self { id: format!("http:{model}:d{dim}"), client, model, dim }
    }
}

#[derive(Deserialize)]
struct EmbeddingWire {
    data: Vec<EmbeddingRowWire>,
}

#[derive(Deserialize)]
struct EmbeddingRowWire {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn embedder_id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp = self
            .client
            .post("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(Error::provider)?
            .error_for_status()
            .map_err(Error::provider)?;
        let wire: EmbeddingWire = resp.json().await.map_err(Error::provider)?;
        if wire.data.len() != texts.len() {
            return Err(Error::provider("embedder returned wrong count"));
        }
        for row in &wire.data {
            if row.embedding.len() != self.dim {
                return Err(Error::provider(format!(
                    "dim mismatch: got {} expected {}",
                    row.embedding.len(),
                    self.dim
                )));
            }
        }
        Ok(wire.data.into_iter().map(|r| r.embedding).collect())
    }
}

pub struct HttpReranker {
    client: OpenAiCompatClient,
    model: String,
}

impl HttpReranker {
    pub fn new(client: OpenAiCompatClient, model: impl Into<String>) -> Self {
        Self { client, model: model.into() }
    }
}

#[derive(Deserialize)]
struct RerankWire {
    results: Vec<RerankRowWire>,
}

#[derive(Deserialize)]
struct RerankRowWire {
    index: usize,
    relevance_score: f32,
}

#[async_trait]
impl RerankProvider for HttpReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<(usize, f32)>> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": candidates,
        });
        let resp = self
            .client
            .post("/rerank")
            .json(&body)
            .send()
            .await
            .map_err(Error::provider)?
            .error_for_status()
            .map_err(Error::provider)?;
        let wire: RerankWire = resp.json().await.map_err(Error::provider)?;
        Ok(wire.results.into_iter().map(|r| (r.index, r.relevance_score)).collect())
    }
}

#[async_trait]
impl ImageProvider for OpenAiCompatClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({ "model": model, "prompt": prompt, "n": 1 });
        let resp = self
            .post("/images/generations")
            .json(&body)
            .send()
            .await
            .map_err(Error::provider)?
            .error_for_status()
            .map_err(Error::provider)?;
        let wire: serde_json::Value = resp.json().await.map_err(Error::provider)?;
        wire["data"][0]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::provider("image response has no url"))
    }
}

/// Provider selection mirroring the embedder bootstrap in the indexing
/// pipeline: `GENTAB_USE_FAKE_EMBEDDINGS` picks the deterministic hashing
/// embedder for offline runs and tests.
pub fn default_embedder(settings: &ProviderSettings) -> Arc<dyn EmbeddingProvider> {
    let use_fake = std::env::var("GENTAB_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if use_fake {
        debug!("using deterministic hashing embedder");
        return Arc::new(crate::mock::HashEmbedder::new(settings.embed_dim));
    }
    Arc::new(HttpEmbedder::new(
        OpenAiCompatClient::from_settings(settings),
        settings.embedding_model.clone(),
        settings.embed_dim,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frames_parse_to_deltas() {
        let delta = parse_sse_data(
            r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
        )
        .unwrap()
        .expect("delta");
        assert_eq!(delta.content, "hel");
        assert_eq!(delta.finish_reason, None);

        let done = parse_sse_data(" [DONE] ").unwrap();
        assert!(done.is_none());

        let terminal = parse_sse_data(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":7}}"#,
        )
        .unwrap()
        .expect("delta");
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        assert_eq!(terminal.usage, Some(Usage { prompt_tokens: 3, completion_tokens: 7 }));

        assert!(parse_sse_data("not json").is_err());
    }

    #[test]
    fn partial_usage_is_unavailable_not_partial() {
        let wire = UsageWire { prompt_tokens: Some(5), completion_tokens: None };
        assert!(wire.into_usage().is_none());
    }
}
