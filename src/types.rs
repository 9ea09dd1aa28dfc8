use serde::{Deserialize, Serialize};

/// Which lane a message belongs to. Lanes partition the working buffer by
/// role for compaction purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Synthetic page-reference markers produced by the compactor.
    Memory,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args_json: String,
}

/// Metadata attached to an assistant message whose tool round was flattened
/// into a narration because the paired results were lost to compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizedToolCall {
    pub id: String,
    pub function: String,
    pub args: String,
    pub result_excerpt: String,
}

/// One entry in the conversation buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Free-form attribution: "user", "agent", a channel name, whatever.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Present only when `role == Tool`. Never empty there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Retention weight in [0,1]. Immutable after creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_tool_call: Option<SummarizedToolCall>,
    /// Set on `Memory`-role page-reference markers and loaded page slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
}

impl Message {
    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            from: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            importance: None,
            summarized_tool_call: None,
            page_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::bare(Role::Assistant, content);
        m.tool_calls = calls;
        m
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::bare(Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m.tool_name = Some(name.into());
        m
    }

    /// A page-reference marker left in the buffer where a group was paged out.
    pub fn page_marker(page_id: impl Into<String>, excerpt: impl Into<String>) -> Self {
        let mut m = Self::bare(Role::Memory, excerpt);
        m.page_id = Some(page_id.into());
        m
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Chars-per-token heuristic. Good enough for trend detection; the budgets
/// all carry reserves so the estimate only has to be stable, not exact.
pub const AVG_CHARS_PER_TOKEN: usize = 4;

/// Flat per-message serialization overhead, in chars.
pub const MESSAGE_OVERHEAD_CHARS: usize = 32;

/// Cap on how many chars of a tool result count toward the estimate. One
/// giant result must not dominate the budget during estimation.
pub const TOOL_RESULT_CHAR_CAP: usize = 24 * 1024;

/// Estimate tokens for a plain string.
pub fn estimate_str_tokens(s: &str) -> usize {
    s.len().div_ceil(AVG_CHARS_PER_TOKEN)
}

/// Estimate tokens for a message, including its tool-call payloads and the
/// per-message overhead.
pub fn estimate_message_tokens(m: &Message) -> usize {
    let mut chars = m.content.len();
    if m.role == Role::Tool {
        chars = chars.min(TOOL_RESULT_CHAR_CAP);
    }
    for call in &m.tool_calls {
        chars += call.name.len() + call.args_json.len();
    }
    (chars + MESSAGE_OVERHEAD_CHARS).div_ceil(AVG_CHARS_PER_TOKEN)
}

/// Estimate tokens for a whole sequence.
pub fn estimate_sequence_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_estimation_rounds_up() {
        assert_eq!(estimate_str_tokens(""), 0);
        assert_eq!(estimate_str_tokens("abc"), 1);
        assert_eq!(estimate_str_tokens("abcd"), 1);
        assert_eq!(estimate_str_tokens("abcde"), 2);
        let s = "a".repeat(400);
        assert_eq!(estimate_str_tokens(&s), 100);
    }

    #[test]
    fn message_estimation_includes_overhead() {
        let m = Message::user("");
        assert_eq!(
            estimate_message_tokens(&m),
            MESSAGE_OVERHEAD_CHARS / AVG_CHARS_PER_TOKEN
        );

        let m = Message::user("a".repeat(400));
        assert_eq!(estimate_message_tokens(&m), (400 + 32) / 4);
    }

    #[test]
    fn giant_tool_result_is_capped() {
        let huge = "x".repeat(TOOL_RESULT_CHAR_CAP * 3);
        let m = Message::tool_result("c1", "read", huge);
        let capped = estimate_message_tokens(&m);
        assert_eq!(capped, (TOOL_RESULT_CHAR_CAP + 32) / 4);

        // Same content as a user message is not capped.
        let m = Message::user("x".repeat(TOOL_RESULT_CHAR_CAP * 3));
        assert!(estimate_message_tokens(&m) > capped);
    }

    #[test]
    fn tool_call_payload_counts() {
        let plain = Message::assistant("calling");
        let with_call = Message::assistant_with_calls(
            "calling",
            vec![ToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                args_json: "{\"path\": \"/tmp/x\"}".into(),
            }],
        );
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }

    #[test]
    fn importance_is_clamped() {
        assert_eq!(Message::user("x").with_importance(3.0).importance, Some(1.0));
        assert_eq!(Message::user("x").with_importance(-1.0).importance, Some(0.0));
    }

    #[test]
    fn roundtrips_through_json() {
        let m = Message::assistant_with_calls(
            "on it",
            vec![ToolCall {
                id: "c9".into(),
                name: "grep".into(),
                args_json: "{}".into(),
            }],
        )
        .with_importance(0.7);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
