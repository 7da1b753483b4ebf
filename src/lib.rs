//! Conversational code-question answering over pluggable exploration tools.
//!
//! The crate wires four pieces together: a bounded tool-use loop
//! ([`AgentLoop`]) that lets a model explore a codebase through namespaced
//! tools, a [`ToolDispatcher`] that routes those invocations to registered
//! [`CapabilityProvider`]s, a rate-limit-aware [`RetryingModelClient`], and a
//! [`ConversationStore`] that owns per-conversation history, a response
//! cache, and admission control.
//!
//! A typical embedding registers its tool providers, builds a store, and
//! calls [`ConversationStore::ask`] per question:
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use codeask::{
//!     AgentConfig, AnthropicProvider, ConversationStore, StoreConfig, ToolDispatcher,
//! };
//! use std::sync::Arc;
//!
//! let provider = Arc::new(AnthropicProvider::new(
//!     std::env::var("ANTHROPIC_API_KEY")?,
//!     "claude-sonnet-4-5-20250929".to_string(),
//! ));
//! let dispatcher = ToolDispatcher::new();
//! let store = ConversationStore::new(
//!     provider,
//!     Arc::new(dispatcher),
//!     AgentConfig::default(),
//!     StoreConfig::default(),
//! );
//! let outcome = store.ask("What does the sync engine do?", None, None, None).await?;
//! println!("{}", outcome.answer);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod agent;
pub mod client;
pub mod dispatch;
pub mod llm;
pub mod providers;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use agent::{tool_category, AgentLoop, StepCategory, StepSink, TextSink, SYSTEM_PROMPT};
pub use client::RetryingModelClient;
pub use dispatch::{CapabilityProvider, Resolution, ToolDispatcher, OVERVIEW_TOOL};
pub use llm::{
    ChatOutcome, ChatRequest, ChatResponse, Content, ContentBlock, Message, ModelProvider,
    QuotaSnapshot, QuotaWindow, Role, StopReason, ToolSchema, Usage,
};
pub use providers::AnthropicProvider;
pub use store::ConversationStore;
pub use types::{AgentConfig, RetryConfig, RunOutcome, StoreConfig};
