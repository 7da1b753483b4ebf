//! Configuration and outcome types.
//!
//! - [`AgentConfig`]: per-run budget and model settings for the agent loop
//! - [`RetryConfig`]: backoff policy for transient provider errors
//! - [`StoreConfig`]: conversation store limits (TTLs, caps, concurrency)
//! - [`RunOutcome`]: the answer plus auxiliary run metadata

use crate::agent::SYSTEM_PROMPT;

/// Configuration and run budget for the agent loop.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Maximum tool-use iterations before a forced tools-free final call.
    pub max_iterations: usize,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// Tool results longer than this are truncated before entering history.
    pub max_tool_result_chars: usize,
    /// System prompt sent on every turn.
    pub system_prompt: String,
    /// Stream the model response and collect text deltas.
    pub streaming: bool,
    /// Retry policy for rate-limited or overloaded model calls.
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_tokens: 4096,
            max_tool_result_chars: 40_000,
            system_prompt: SYSTEM_PROMPT.to_string(),
            streaming: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff policy for transient provider pressure.
///
/// A provider-supplied retry-after hint wins; without one the delay grows
/// linearly (`base_delay_ms * attempt`).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds when the provider gives no hint.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Fast retries for tests.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
        }
    }
}

/// Limits owned by the conversation store. Resolved values are handed in by
/// the embedding application; the core does not read the environment.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Maximum concurrent agent runs admitted system-wide.
    pub max_concurrency: usize,
    /// Seconds since last access after which a conversation is swept.
    pub conversation_ttl_secs: u64,
    /// Message-count cap; longer histories are truncated before a run.
    pub max_history_messages: usize,
    /// Seconds a cached stateless answer stays live.
    pub response_cache_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            conversation_ttl_secs: 3600,
            max_history_messages: 30,
            response_cache_ttl_secs: 600,
        }
    }
}

/// Result of one completed agent run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// The synthesized final answer.
    pub answer: String,
    /// Repository files the run read, in first-touch order.
    pub files_consulted: Vec<String>,
}
