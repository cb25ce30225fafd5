//! Model client trait and HTTP providers.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{Error, Result};

use super::types::{EmbedReply, EmbedRequest, PromptReply, PromptRequest, Provider, TokenUsage};

/// Text completion and embedding endpoints of one provider.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptReply>;

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedReply>;

    fn provider(&self) -> Provider;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Shared HTTP plumbing: base URL, auth and error mapping.
struct Transport {
    http: Client,
    config: ClientConfig,
    provider: Provider,
    default_base: &'static str,
}

impl Transport {
    fn new(config: ClientConfig, provider: Provider, default_base: &'static str) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            provider,
            default_base,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.config.base_url.as_deref().unwrap_or(self.default_base),
            path
        )
    }

    fn model<'a>(&'a self, requested: &'a Option<String>, fallback: &'a str) -> &'a str {
        requested
            .as_deref()
            .or(self.config.default_model.as_deref())
            .unwrap_or(fallback)
    }

    /// Send `request` and decode the body as `R`. Every failure maps to
    /// `capability` being unavailable so callers fall back or retry.
    async fn send<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        capability: &'static str,
    ) -> Result<R> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable(capability, format!("{} request failed: {}", self.provider, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::unavailable(capability, format!("{} body unreadable: {}", self.provider, e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(Error::unavailable(
                capability,
                format!("{} returned {}: {}", self.provider, status, detail),
            ));
        }
        debug!(provider = %self.provider, status = status.as_u16(), bytes = body.len(), "Model call ok");
        serde_json::from_str(&body).map_err(|e| {
            Error::unavailable(capability, format!("{} reply not understood: {}", self.provider, e))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Turn {
    role: String,
    content: String,
}

impl Turn {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

// ==================== Anthropic ====================

/// Anthropic Messages API. Has no embedding endpoint.
pub struct AnthropicClient {
    transport: Transport,
}

impl AnthropicClient {
    const BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const MODEL: &'static str = "claude-3-5-haiku-20241022";

    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(config, Provider::Anthropic, Self::BASE_URL)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Turn>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptReply> {
        let t = &self.transport;
        let body = MessagesBody {
            model: t.model(&request.model, Self::MODEL),
            system: &request.instructions,
            messages: vec![Turn::new("user", &request.input)],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let call = t
            .http
            .post(t.url("/v1/messages"))
            .header("x-api-key", &t.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body);
        let reply: MessagesReply = t.send(call, "model").await?;

        Ok(PromptReply {
            model: reply.model,
            text: reply.content.into_iter().filter_map(|b| b.text).collect(),
            truncated: reply.stop_reason.as_deref() == Some("max_tokens"),
            usage: TokenUsage {
                input_tokens: reply.usage.input_tokens,
                output_tokens: reply.usage.output_tokens,
            },
        })
    }

    async fn embed(&self, _request: EmbedRequest) -> Result<EmbedReply> {
        Err(Error::unavailable("embedding", "anthropic has no embedding endpoint"))
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

// ==================== OpenAI-compatible ====================

/// OpenAI-compatible chat completions and embeddings.
pub struct OpenAIClient {
    transport: Transport,
}

impl OpenAIClient {
    const BASE_URL: &'static str = "https://api.openai.com";
    const MODEL: &'static str = "gpt-4o-mini";
    const EMBEDDING_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(config, Provider::OpenAI, Self::BASE_URL)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Turn>,
    max_tokens: u32,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Turn,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsReply {
    model: String,
    data: Vec<EmbeddingItem>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptReply> {
        let t = &self.transport;
        let body = ChatBody {
            model: t.model(&request.model, Self::MODEL),
            messages: vec![
                Turn::new("system", &request.instructions),
                Turn::new("user", &request.input),
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: ResponseFormat { kind: "json_object" },
        };
        let call = t
            .http
            .post(t.url("/v1/chat/completions"))
            .bearer_auth(&t.config.api_key)
            .json(&body);
        let reply: ChatReply = t.send(call, "model").await?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::unavailable("model", "openai reply had no choices"))?;
        let usage = reply.usage.unwrap_or_default();
        Ok(PromptReply {
            model: reply.model,
            text: choice.message.content,
            truncated: choice.finish_reason.as_deref() == Some("length"),
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedReply> {
        let t = &self.transport;
        let body = EmbeddingsBody {
            model: request.model.as_deref().unwrap_or(Self::EMBEDDING_MODEL),
            input: &request.inputs,
        };
        let call = t
            .http
            .post(t.url("/v1/embeddings"))
            .bearer_auth(&t.config.api_key)
            .json(&body);
        let mut reply: EmbeddingsReply = t.send(call, "embedding").await?;

        reply.data.sort_by_key(|d| d.index);
        Ok(EmbedReply {
            model: reply.model,
            vectors: reply.data.into_iter().map(|d| d.embedding).collect(),
            input_tokens: reply.usage.map(|u| u.prompt_tokens).unwrap_or(0),
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

/// [`Embedder`] over a client's embedding endpoint, checking the dimension
/// of every vector it returns.
pub struct ClientEmbedder {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
    dimension: usize,
}

impl ClientEmbedder {
    pub fn new(client: Arc<dyn LLMClient>, dimension: usize) -> Self {
        Self {
            client,
            model: None,
            dimension,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl Embedder for ClientEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = EmbedRequest::single(text);
        if let Some(ref model) = self.model {
            request = request.with_model(model.clone());
        }
        let vector = self
            .client
            .embed(request)
            .await?
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::unavailable("embedding", "empty embedding reply"))?;
        if vector.len() != self.dimension {
            return Err(Error::unavailable(
                "embedding",
                format!("expected {} dimensions, got {}", self.dimension, vector.len()),
            ));
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        self.client.provider().as_str()
    }
}
