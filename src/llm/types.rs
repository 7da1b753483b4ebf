use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// A single request to the reasoning model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    /// When true the provider consumes the response as an SSE stream and
    /// collects text deltas into `ChatResponse::text_chunks`.
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    #[must_use]
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Blocks(blocks),
        }
    }

    /// A `user` turn carrying one tool-result block per completed invocation,
    /// in the order the invocations were requested.
    #[must_use]
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::User,
            content: Content::Blocks(
                results
                    .into_iter()
                    .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: None,
                    })
                    .collect(),
            ),
        }
    }

    /// True if any content block is a tool-invocation request.
    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        match &self.content {
            Content::Text(_) => false,
            Content::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. })),
        }
    }

    /// True if any content block is a tool result.
    #[must_use]
    pub fn has_tool_result(&self) -> bool {
        match &self.content {
            Content::Text(_) => false,
            Content::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. })),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content blocks in the Anthropic Messages wire shape, reused verbatim by
/// the HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Schema for one tool offered to the model.
///
/// Provider tools carry namespaced names (`provider:tool`); local virtual
/// tools are unqualified. Immutable once registered for a run.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
    /// Text deltas collected while streaming. Empty for non-streamed calls.
    /// The loop flushes these to the caller only on the terminal answer turn.
    pub text_chunks: Vec<String>,
    /// Rate-limit quota state reported by the provider, when available.
    pub quota: Option<QuotaSnapshot>,
}

impl ChatResponse {
    /// Concatenate all text blocks into the answer text.
    #[must_use]
    pub fn answer_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool invocations requested by this response, in content order.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One rate-limit dimension as reported by the provider's response headers.
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    pub remaining: u64,
    pub limit: u64,
    pub reset: Option<OffsetDateTime>,
}

impl QuotaWindow {
    /// Time to wait until this window resets, zero if already reset.
    #[must_use]
    pub fn until_reset(&self, now: OffsetDateTime) -> Duration {
        match self.reset {
            Some(reset) if reset > now => {
                Duration::from_secs_f64((reset - now).as_seconds_f64().max(0.0))
            }
            _ => Duration::ZERO,
        }
    }
}

/// Quota state for the two independent dimensions the provider tracks.
#[derive(Debug, Clone, Default)]
pub struct QuotaSnapshot {
    pub requests: Option<QuotaWindow>,
    pub input_tokens: Option<QuotaWindow>,
}

/// Classified outcome of one model call attempt.
///
/// Only `RateLimited` and `Overloaded` are retried; `Failed` carries
/// non-retryable provider errors (auth failure, malformed request, ...).
#[derive(Debug)]
pub enum ChatOutcome {
    Success(ChatResponse),
    RateLimited { retry_after: Option<Duration> },
    Overloaded { retry_after: Option<Duration> },
    Failed { status: u16, message: String },
}
