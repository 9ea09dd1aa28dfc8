use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::driver::{ChatDriver, ChatOptions};
use crate::types::Message;

/// Fallback text used whenever a summarizer call fails or times out. The
/// store treats it as a normal summary; `page_created` still fires.
pub const FALLBACK_SUMMARY: &str = "(content was summarized; original unavailable)";

const SUMMARIZE_PROMPT: &str = "\
Summarize the following conversation excerpt in 2-4 dense sentences. \
Preserve names, identifiers, decisions, and outcomes. The summary replaces \
the originals in a bounded context window, so keep anything a future turn \
might need to recall.";

/// Summarization capability consumed by the store and the batch job.
/// Implementations must be total: bounded latency, and on any internal
/// failure return a short fallback string rather than an error.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, label: &str) -> String;
}

/// Adapts a `ChatDriver` into a summarizer with a hard timeout. Errors and
/// timeouts degrade to `FALLBACK_SUMMARY` with a warning; nothing propagates
/// into the caller.
pub struct DriverSummarizer {
    driver: Arc<dyn ChatDriver>,
    model: String,
    timeout: Duration,
}

impl DriverSummarizer {
    pub fn new(driver: Arc<dyn ChatDriver>, model: impl Into<String>) -> Self {
        Self {
            driver,
            model: model.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Summarizer for DriverSummarizer {
    async fn summarize(&self, text: &str, label: &str) -> String {
        let prompt = format!("{SUMMARIZE_PROMPT}\n\n[{label}]\n{text}");
        let messages = vec![Message::user(prompt)];
        let options = ChatOptions {
            model: self.model.clone(),
            ..ChatOptions::default()
        };

        match tokio::time::timeout(self.timeout, self.driver.chat(&messages, &options)).await {
            Ok(Ok(outcome)) if !outcome.text.trim().is_empty() => outcome.text,
            Ok(Ok(_)) => {
                warn!(label, "summarizer returned empty text, using fallback");
                FALLBACK_SUMMARY.to_string()
            }
            Ok(Err(e)) => {
                warn!(label, error = %e, "summarizer call failed, using fallback");
                FALLBACK_SUMMARY.to_string()
            }
            Err(_) => {
                warn!(label, timeout = ?self.timeout, "summarizer timed out, using fallback");
                FALLBACK_SUMMARY.to_string()
            }
        }
    }
}

/// Canned summarizer for tests and offline runs.
pub struct FixedSummarizer {
    text: String,
}

impl FixedSummarizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for FixedSummarizer {
    fn default() -> Self {
        Self::new("summary")
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _text: &str, label: &str) -> String {
        format!("{} [{label}]", self.text)
    }
}
