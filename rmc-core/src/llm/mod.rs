//! Model client abstraction.
//!
//! A thin provider-neutral interface used by [`crate::inference::ModelInference`]
//! for JSON classification prompts and by [`ClientEmbedder`] for remote embeddings.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rmc_core::llm::{AnthropicClient, ClientConfig, LLMClient, PromptRequest};
//!
//! let client = AnthropicClient::new(
//!     ClientConfig::new("your-api-key").with_default_model("claude-3-5-haiku-20241022"),
//! )?;
//!
//! let reply = client
//!     .prompt(PromptRequest::new("Reply with a JSON object only.", "Classify: ..."))
//!     .await?;
//! let json = reply.json_body();
//! ```

mod client;
mod types;

pub use client::{AnthropicClient, ClientConfig, ClientEmbedder, LLMClient, OpenAIClient};
pub use types::{EmbedReply, EmbedRequest, PromptReply, PromptRequest, Provider, TokenUsage};
