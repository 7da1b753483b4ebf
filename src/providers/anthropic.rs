//! Anthropic Messages API provider.
//!
//! Implements [`ModelProvider`] over reqwest. Rate-limit (429) and overload
//! (529) responses are classified, not raised, so the retrying client can
//! back off; rate-limit quota headers are parsed into a [`QuotaSnapshot`]
//! on every successful response. Streaming requests are consumed as SSE and
//! the text deltas collected into `ChatResponse::text_chunks`.

use crate::llm::{
    ChatOutcome, ChatRequest, ChatResponse, ContentBlock, ModelProvider, QuotaSnapshot,
    QuotaWindow, StopReason, ToolSchema, Usage,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        // No overall timeout: streaming turns can run long. Connect timeout
        // and keepalive guard against dead connections.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            model,
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let api_request = ApiRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(&request.tools)
            },
            stream: request.stream,
        };

        log::debug!(
            "Anthropic request model={} messages={} tools={} stream={}",
            self.model,
            request.messages.len(),
            request.tools.len(),
            request.stream
        );

        self.client
            .post(format!("{API_BASE_URL}/v1/messages"))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| anyhow!("request failed: {e}"))
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let response = self.send(&request).await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(ChatOutcome::RateLimited {
                retry_after: retry_after(&headers),
            });
        }
        if status.as_u16() == 529 {
            return Ok(ChatOutcome::Overloaded {
                retry_after: retry_after(&headers),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Anthropic error status={status} body={body}");
            return Ok(ChatOutcome::Failed {
                status: status.as_u16(),
                message: body,
            });
        }

        let quota = quota_from_headers(&headers);

        if request.stream {
            let mut chat = consume_sse(response).await?;
            chat.model = self.model.clone();
            chat.quota = quota;
            Ok(ChatOutcome::Success(chat))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| anyhow!("failed to read response body: {e}"))?;
            let api: ApiResponse = serde_json::from_slice(&bytes)
                .map_err(|e| anyhow!("failed to parse response: {e}"))?;
            Ok(ChatOutcome::Success(ChatResponse {
                id: api.id,
                content: api.content,
                model: api.model,
                stop_reason: api.stop_reason,
                usage: api.usage,
                text_chunks: Vec::new(),
                quota,
            }))
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }
}

#[derive(serde::Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [crate::llm::Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSchema]>,
    stream: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_reset(headers: &HeaderMap, name: &str) -> Option<OffsetDateTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
}

fn quota_window(headers: &HeaderMap, kind: &str) -> Option<QuotaWindow> {
    let remaining = header_u64(headers, &format!("anthropic-ratelimit-{kind}-remaining"))?;
    Some(QuotaWindow {
        remaining,
        limit: header_u64(headers, &format!("anthropic-ratelimit-{kind}-limit")).unwrap_or(1),
        reset: header_reset(headers, &format!("anthropic-ratelimit-{kind}-reset")),
    })
}

/// Both quota dimensions, when the provider reported either.
pub(crate) fn quota_from_headers(headers: &HeaderMap) -> Option<QuotaSnapshot> {
    let snapshot = QuotaSnapshot {
        requests: quota_window(headers, "requests"),
        input_tokens: quota_window(headers, "input-tokens"),
    };
    if snapshot.requests.is_none() && snapshot.input_tokens.is_none() {
        None
    } else {
        Some(snapshot)
    }
}

// ============================================================================
// SSE stream consumption
// ============================================================================

/// In-progress content block while accumulating a stream.
enum BlockBuilder {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

#[derive(Default)]
pub(crate) struct SseAccumulator {
    blocks: Vec<BlockBuilder>,
    text_chunks: Vec<String>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl SseAccumulator {
    /// Apply one complete SSE event block (`event:` + `data:` lines).
    pub(crate) fn apply(&mut self, event_block: &str) {
        let mut event_type = None;
        let mut data = None;
        for line in event_block.lines() {
            if let Some(value) = line.strip_prefix("event: ") {
                event_type = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("data: ") {
                data = Some(value);
            }
        }
        let Some(data) = data else { return };

        match event_type {
            Some("message_start") => {
                if let Ok(event) = serde_json::from_str::<SseMessageStart>(data) {
                    self.input_tokens = event.message.usage.input_tokens;
                }
            }
            Some("content_block_start") => {
                if let Ok(event) = serde_json::from_str::<SseContentBlockStart>(data) {
                    let builder = match event.content_block {
                        SseContentBlock::Text => BlockBuilder::Text(String::new()),
                        SseContentBlock::ToolUse { id, name } => BlockBuilder::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    };
                    if event.index == self.blocks.len() {
                        self.blocks.push(builder);
                    }
                }
            }
            Some("content_block_delta") => {
                if let Ok(event) = serde_json::from_str::<SseContentBlockDelta>(data) {
                    match (self.blocks.get_mut(event.index), event.delta) {
                        (Some(BlockBuilder::Text(text)), SseDelta::TextDelta { text: delta }) => {
                            text.push_str(&delta);
                            self.text_chunks.push(delta);
                        }
                        (
                            Some(BlockBuilder::ToolUse { json, .. }),
                            SseDelta::InputJsonDelta { partial_json },
                        ) => {
                            json.push_str(&partial_json);
                        }
                        _ => {}
                    }
                }
            }
            Some("message_delta") => {
                if let Ok(event) = serde_json::from_str::<SseMessageDelta>(data) {
                    if let Some(reason) = event.delta.stop_reason {
                        self.stop_reason = Some(reason);
                    }
                    if let Some(usage) = event.usage {
                        self.output_tokens = usage.output_tokens;
                    }
                }
            }
            Some("message_stop") => {
                self.done = true;
            }
            _ => {}
        }
    }

    pub(crate) fn finish(self) -> Result<ChatResponse> {
        if !self.done {
            return Err(anyhow!("stream ended without message_stop"));
        }
        let content = self
            .blocks
            .into_iter()
            .map(|builder| match builder {
                BlockBuilder::Text(text) => Ok(ContentBlock::Text { text }),
                BlockBuilder::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json)
                            .map_err(|e| anyhow!("bad tool input json for '{name}': {e}"))?
                    };
                    Ok(ContentBlock::ToolUse { id, name, input })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChatResponse {
            id: String::new(),
            content,
            model: String::new(),
            stop_reason: self.stop_reason,
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            },
            text_chunks: self.text_chunks,
            quota: None,
        })
    }
}

async fn consume_sse(response: reqwest::Response) -> Result<ChatResponse> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut accumulator = SseAccumulator::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow!("stream error: {e}"))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Complete SSE events are separated by blank lines.
        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            accumulator.apply(&event_block);
        }
    }

    let remaining = buffer.trim().to_string();
    if !remaining.is_empty() {
        accumulator.apply(&remaining);
    }

    accumulator.finish()
}

#[derive(Deserialize)]
struct SseMessageStart {
    message: SseMessageHead,
}

#[derive(Deserialize)]
struct SseMessageHead {
    usage: Usage,
}

#[derive(Deserialize)]
struct SseContentBlockStart {
    index: usize,
    content_block: SseContentBlock,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseContentBlock {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
struct SseContentBlockDelta {
    index: usize,
    delta: SseDelta,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct SseMessageDelta {
    delta: SseStopDelta,
    usage: Option<SseOutputUsage>,
}

#[derive(Deserialize)]
struct SseStopDelta {
    stop_reason: Option<StopReason>,
}

#[derive(Deserialize)]
struct SseOutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn quota_headers_parse_both_dimensions() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-remaining", "3"),
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-reset", "2026-01-01T00:01:00Z"),
            ("anthropic-ratelimit-input-tokens-remaining", "9000"),
            ("anthropic-ratelimit-input-tokens-limit", "100000"),
        ]);
        let quota = quota_from_headers(&map).unwrap();
        let requests = quota.requests.unwrap();
        assert_eq!(requests.remaining, 3);
        assert_eq!(requests.limit, 50);
        assert!(requests.reset.is_some());
        let tokens = quota.input_tokens.unwrap();
        assert_eq!(tokens.remaining, 9000);
        assert!(tokens.reset.is_none());
    }

    #[test]
    fn missing_quota_headers_give_none() {
        assert!(quota_from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let map = headers(&[("retry-after", "17")]);
        assert_eq!(retry_after(&map), Some(Duration::from_secs(17)));
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn sse_text_stream_accumulates_blocks_and_chunks() {
        let mut acc = SseAccumulator::default();
        acc.apply("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":0}}}");
        acc.apply("event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}");
        acc.apply("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}");
        acc.apply("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}");
        acc.apply("event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}");
        acc.apply("event: message_stop\ndata: {\"type\":\"message_stop\"}");

        let response = acc.finish().unwrap();
        assert_eq!(response.answer_text(), "Hello");
        assert_eq!(response.text_chunks, vec!["Hel", "lo"]);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 5);
    }

    #[test]
    fn sse_tool_use_assembles_partial_json() {
        let mut acc = SseAccumulator::default();
        acc.apply("event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"serena:read_file\"}}");
        acc.apply("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}");
        acc.apply("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"src/a.rs\\\"}\"}}");
        acc.apply("event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":3}}");
        acc.apply("event: message_stop\ndata: {\"type\":\"message_stop\"}");

        let response = acc.finish().unwrap();
        let uses: Vec<_> = response.tool_uses().collect();
        assert_eq!(uses.len(), 1);
        let (id, name, input) = uses[0];
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "serena:read_file");
        assert_eq!(input["path"], "src/a.rs");
        // Tool planning turns produce no text chunks to surface.
        assert!(response.text_chunks.is_empty());
    }

    #[test]
    fn interrupted_stream_is_an_error() {
        let mut acc = SseAccumulator::default();
        acc.apply("event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}");
        let err = acc.finish().unwrap_err();
        assert!(err.to_string().contains("without message_stop"));
    }
}
