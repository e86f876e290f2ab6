//! HTTP client for the chat-completion, embeddings, and rerank endpoints.

use crate::provider::error::ProviderError;
use crate::provider::extract::normalize_response_message;
use crate::provider::sse::SseParser;
use crate::provider::stream::{StreamChunk, ToolCallBuilder, accumulate_deltas, finish_tool_calls};
use crate::provider::types::{ChatRequest, ChatResponse, StreamEvent, ToolDefinition};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-request wall-clock deadline. Expiry aborts without retry.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry budget for 5xx responses and transport failures.
const MAX_RETRIES: u32 = 3;
/// Linear backoff base: delay = attempt * base.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Chat-completion surface the agent loop depends on. Concrete transport is
/// [`CompletionClient`]; tests inject scripted implementations.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Embedding surface the memory store depends on.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Rerank surface the memory store optionally uses.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

/// Client for an OpenAI-compatible completion service.
pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    rerank_model: Option<String>,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            rerank_model: None,
        }
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    #[must_use]
    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank_model = Some(model.into());
        self
    }

    fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                ProviderError::Network("API key contains invalid header characters".to_string())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn send_once<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("{e} in response body: {text}")))
    }

    /// POST with the retry schedule: 5xx and transport failures retry up to
    /// three times with linear backoff; timeouts surface immediately.
    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(path, body).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = BACKOFF_BASE * attempt;
                    warn!(
                        "{path} failed ({err}), retrying in {}s (attempt {attempt}/{MAX_RETRIES})",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stream a chat completion as SSE chunks.
    ///
    /// Tool definitions are rejected here: the remote service does not
    /// guarantee tool choice in streaming mode. Tool-call deltas that arrive
    /// anyway are aggregated and emitted as complete calls at the end.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        if !request.tools.is_empty() {
            return Err(ProviderError::Stream(
                "tools are not supported in streaming mode".to_string(),
            ));
        }

        let payload = build_chat_payload(&request, true);
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let mut bytes = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut builders: HashMap<usize, ToolCallBuilder> = HashMap::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Stream(e.to_string()))?;
            let text = String::from_utf8_lossy(&chunk);

            for event in parser.feed(&text) {
                if event.data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<StreamChunk>(&event.data) {
                    Ok(chunk) => {
                        for choice in &chunk.choices {
                            if let Some(delta) = &choice.delta.content
                                && !delta.is_empty()
                            {
                                let _ = tx.send(StreamEvent::TextDelta(delta.clone())).await;
                            }
                        }
                        accumulate_deltas(&chunk, &mut builders);
                        if let Some(usage) = chunk.usage {
                            let _ = tx.send(StreamEvent::Usage(usage)).await;
                        }
                    }
                    Err(e) => {
                        warn!("unparsable stream chunk: {e}\ndata: {}", event.data);
                    }
                }
            }
        }

        for call in finish_tool_calls(builders) {
            let _ = tx.send(StreamEvent::ToolCall(call)).await;
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }

    /// Embed a batch of inputs, one vector per input.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct Response {
            data: Vec<EmbeddingData>,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        let response: Response = self
            .post_json(
                "/embeddings",
                &Request {
                    model: &self.embedding_model,
                    input: inputs,
                },
            )
            .await?;

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl CompletionApi for CompletionClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let payload = build_chat_payload(&request, false);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat completion request"
        );

        let mut response: ChatResponse = self.post_json("/chat/completions", &payload).await?;
        if let Some(choice) = response.choices.first_mut() {
            normalize_response_message(&mut choice.message);
        }
        Ok(response)
    }
}

#[async_trait]
impl Embedder for CompletionClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let input = vec![text.to_string()];
        let mut vectors = self.embed_batch(&input).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Parse("embeddings response was empty".to_string()))
    }
}

#[async_trait]
impl Reranker for CompletionClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        #[derive(Serialize)]
        struct Request<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            model: Option<&'a str>,
            query: &'a str,
            documents: &'a [String],
            top_n: usize,
        }

        #[derive(Deserialize)]
        struct Response {
            results: Vec<RerankResult>,
        }

        let response: Response = self
            .post_json(
                "/rerank",
                &Request {
                    model: self.rerank_model.as_deref(),
                    query,
                    documents,
                    top_n,
                },
            )
            .await?;

        Ok(response.results)
    }
}

/// Serialize a [`ChatRequest`] into the wire payload.
fn build_chat_payload(request: &ChatRequest, stream: bool) -> serde_json::Value {
    #[derive(Serialize)]
    struct ToolPayload<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        function: &'a ToolDefinition,
    }

    let mut payload = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "stream": stream,
    });

    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = max_tokens.into();
    }
    if let Some(temperature) = request.temperature {
        payload["temperature"] = temperature.into();
    }
    if !request.tools.is_empty() {
        let tools: Vec<ToolPayload> = request
            .tools
            .iter()
            .map(|t| ToolPayload {
                kind: "function",
                function: t,
            })
            .collect();
        payload["tools"] = serde_json::to_value(tools).unwrap_or_default();
        payload["tool_choice"] = "auto".into();
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::Message;

    #[test]
    fn chat_payload_includes_tools_and_choice() {
        let request = ChatRequest::new("m", vec![Message::user("hi")]).with_tools(vec![
            ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a file".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            },
        ]);
        let payload = build_chat_payload(&request, false);
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["tools"][0]["type"], "function");
        assert_eq!(payload["tools"][0]["function"]["name"], "read_file");
        assert_eq!(payload["tool_choice"], "auto");
    }

    #[test]
    fn chat_payload_without_tools_omits_choice() {
        let request = ChatRequest::new("m", vec![Message::user("hi")]);
        let payload = build_chat_payload(&request, true);
        assert_eq!(payload["stream"], true);
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
    }

    #[tokio::test]
    async fn chat_stream_rejects_tools() {
        let client = CompletionClient::new("http://localhost:0", None);
        let request = ChatRequest::new("m", vec![Message::user("hi")]).with_tools(vec![
            ToolDefinition {
                name: "x".to_string(),
                description: String::new(),
                parameters: serde_json::json!({}),
            },
        ]);
        let (tx, _rx) = mpsc::channel(8);
        let err = client.chat_stream(request, tx).await.unwrap_err();
        assert!(matches!(err, ProviderError::Stream(_)));
    }

    #[test]
    fn bearer_header_present_when_key_set() {
        let client = CompletionClient::new("http://api.example.com/v1/", Some("sk-test".into()));
        let headers = client.headers().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(client.base_url, "http://api.example.com/v1");
    }

    #[test]
    fn no_auth_header_without_key() {
        let client = CompletionClient::new("http://localhost:8080", None);
        let headers = client.headers().unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }
}
