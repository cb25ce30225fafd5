//! Wire-neutral request and reply types.
//!
//! Every model call made by the engine is a single-turn prompt that expects
//! a JSON object back, so there is no conversation history here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    OpenAI,
    /// In-process stand-in (tests, offline runs)
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction plus one input, answered in one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Overrides the client's default model
    pub model: Option<String>,
    pub instructions: String,
    pub input: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl PromptRequest {
    /// Deterministic request: temperature 0, 1024 output tokens.
    pub fn new(instructions: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            model: None,
            instructions: instructions.into(),
            input: input.into(),
            max_tokens: 1024,
            temperature: 0.0,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptReply {
    pub model: String,
    pub text: String,
    /// Generation hit the token limit
    pub truncated: bool,
    pub usage: TokenUsage,
}

impl PromptReply {
    /// Reply carrying only text, for local clients and tests.
    pub fn text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            text: text.into(),
            truncated: false,
            usage: TokenUsage::default(),
        }
    }

    /// The outermost `{...}` in the reply; models often wrap JSON in prose
    /// or code fences.
    pub fn json_body(&self) -> &str {
        match (self.text.find('{'), self.text.rfind('}')) {
            (Some(start), Some(end)) if end > start => &self.text[start..=end],
            _ => &self.text,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub model: Option<String>,
    pub inputs: Vec<String>,
}

impl EmbedRequest {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            model: None,
            inputs: vec![text.into()],
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// One vector per input, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedReply {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
    pub input_tokens: u64,
}
