use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;
use crate::types::{Message, ToolCall};

/// Pure LLM API call. No state, no history, no context management.
/// Messages in, outcome out. Provider wire protocols live outside the core;
/// implement this for whatever backend is in play.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatOutcome, DriverError>;

    /// Streaming variant. Implementations send incremental chunks through
    /// `tx` and still return the assembled outcome. The default ignores the
    /// channel and falls back to `chat`.
    async fn stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        tx: tokio::sync::mpsc::UnboundedSender<StreamChunk>,
    ) -> Result<ChatOutcome, DriverError> {
        let outcome = self.chat(messages, options).await?;
        let _ = tx.send(StreamChunk::Token(outcome.text.clone()));
        Ok(outcome)
    }
}

/// Per-call knobs. Everything optional defaults to the provider's own
/// defaults; the core only sets what a directive or the thinking dial asked for.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: String,
    /// Tool definitions, provider-shaped. Opaque to the core.
    pub tools: Vec<serde_json::Value>,
    /// Scalar thinking budget in [0,1]; None leaves thinking off.
    pub thinking_budget: Option<f32>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub logprobs: bool,
    /// Abort signal. Cancelling mid-stream is safe as long as the marker
    /// parser's flush() still runs.
    pub signal: Option<CancellationToken>,
}

/// An incremental piece of a streamed response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Token(String),
    ReasoningToken(String),
}

/// What came back from the model.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Token usage for a single call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}
