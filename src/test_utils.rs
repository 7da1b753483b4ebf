//! Shared test doubles: a scripted model provider, a configurable capability
//! provider, and recording sinks.

use crate::agent::{StepCategory, StepSink, TextSink};
use crate::dispatch::CapabilityProvider;
use crate::llm::{
    ChatOutcome, ChatRequest, ChatResponse, ContentBlock, ModelProvider, StopReason, ToolSchema,
    Usage,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Model provider that replays a scripted sequence of outcomes. Once the
/// script is exhausted it falls back to a plain "Done" text response.
pub struct MockProvider {
    responses: Mutex<VecDeque<ChatOutcome>>,
    calls: Mutex<usize>,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<ChatOutcome>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn text_response(text: &str) -> ChatOutcome {
        Self::text_response_with_chunks(text, Vec::new())
    }

    pub fn text_response_with_chunks(text: &str, chunks: Vec<String>) -> ChatOutcome {
        ChatOutcome::Success(ChatResponse {
            id: "msg_test".to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            model: "mock".to_string(),
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
            text_chunks: chunks,
            quota: None,
        })
    }

    pub fn tool_use_response(uses: Vec<(&str, &str, Value)>) -> ChatOutcome {
        Self::tool_use_response_with_chunks(uses, Vec::new())
    }

    pub fn tool_use_response_with_chunks(
        uses: Vec<(&str, &str, Value)>,
        chunks: Vec<String>,
    ) -> ChatOutcome {
        let content = uses
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect();
        ChatOutcome::Success(ChatResponse {
            id: "msg_test".to_string(),
            content,
            model: "mock".to_string(),
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage::default(),
            text_chunks: chunks,
            quota: None,
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        *self.calls.lock().unwrap() += 1;
        *self.last_request.lock().unwrap() = Some(request);
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Self::text_response("Done")))
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn provider(&self) -> &'static str {
        "mock"
    }
}

/// Capability provider whose tools answer with canned text, optionally
/// delayed or failing per tool.
pub struct MockCapability {
    name: String,
    tools: Vec<String>,
    failing: HashSet<String>,
    delays_ms: HashMap<String, u64>,
    fixed_result: Option<String>,
}

impl MockCapability {
    pub fn new(name: &str, tools: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.into_iter().map(str::to_string).collect(),
            failing: HashSet::new(),
            delays_ms: HashMap::new(),
            fixed_result: None,
        }
    }

    pub fn failing(mut self, tool: &str) -> Self {
        self.failing.insert(tool.to_string());
        self
    }

    pub fn with_delay(mut self, tool: &str, millis: u64) -> Self {
        self.delays_ms.insert(tool.to_string(), millis);
        self
    }

    pub fn with_fixed_result(mut self, result: String) -> Self {
        self.fixed_result = Some(result);
        self
    }
}

#[async_trait]
impl CapabilityProvider for MockCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|tool| ToolSchema {
                name: tool.clone(),
                description: format!("mock tool {tool}"),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn call_tool(&self, tool: &str, _input: &Value) -> Result<String> {
        if let Some(millis) = self.delays_ms.get(tool) {
            tokio::time::sleep(Duration::from_millis(*millis)).await;
        }
        if self.failing.contains(tool) {
            bail!("mock failure in {tool}");
        }
        Ok(self
            .fixed_result
            .clone()
            .unwrap_or_else(|| format!("result of {tool}")))
    }
}

#[derive(Default)]
pub struct StepRecorder {
    seen: Mutex<Vec<StepCategory>>,
}

impl StepRecorder {
    pub fn seen(&self) -> Vec<StepCategory> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepSink for StepRecorder {
    async fn step(&self, category: StepCategory) {
        self.seen.lock().unwrap().push(category);
    }
}

#[derive(Default)]
pub struct ChunkRecorder {
    seen: Mutex<Vec<String>>,
}

impl ChunkRecorder {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextSink for ChunkRecorder {
    async fn text_chunk(&self, chunk: &str) {
        self.seen.lock().unwrap().push(chunk.to_string());
    }
}
