//! Rate-limit-aware wrapper around a single model call.
//!
//! Retries rate-limited and overloaded attempts with backoff, preferring the
//! provider's retry-after hint, and converts near-exhausted quota into
//! proactive pacing: after a successful attempt the client sleeps until the
//! quota window resets before returning, so callers see smooth latency
//! instead of hard 429 failures.

use crate::llm::{
    ChatOutcome, ChatRequest, ChatResponse, Message, ModelProvider, QuotaSnapshot, ToolSchema,
};
use anyhow::{bail, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;

pub struct RetryingModelClient<P> {
    provider: Arc<P>,
    config: crate::types::AgentConfig,
}

impl<P: ModelProvider> RetryingModelClient<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: crate::types::AgentConfig) -> Self {
        Self { provider, config }
    }

    /// One logical model call with retry, backoff, and quota pacing.
    ///
    /// Only rate-limit and overload outcomes are retried, up to the
    /// configured attempt ceiling; any other provider error is raised
    /// immediately. Exhausting all attempts raises the last error.
    pub async fn call(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system: &str,
        stream: bool,
    ) -> Result<ChatResponse> {
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let request = ChatRequest {
                system: system.to_string(),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                max_tokens: self.config.max_tokens,
                stream,
            };

            let (kind, retry_after) = match self.provider.chat(request).await? {
                ChatOutcome::Success(response) => {
                    if let Some(quota) = &response.quota {
                        pace_for_quota(quota, OffsetDateTime::now_utc()).await;
                    }
                    return Ok(response);
                }
                ChatOutcome::RateLimited { retry_after } => ("rate limited", retry_after),
                ChatOutcome::Overloaded { retry_after } => ("overloaded", retry_after),
                ChatOutcome::Failed { status, message } => {
                    bail!("model call failed (status={status}): {message}");
                }
            };

            if attempt == max_attempts {
                bail!("model {kind} after {max_attempts} attempts");
            }

            let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
            warn!(
                "Model {kind}, retrying in {}ms (attempt={attempt}/{max_attempts})",
                delay.as_millis()
            );
            sleep(delay).await;
        }

        unreachable!("attempt loop always returns or bails")
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.config
                .retry
                .base_delay_ms
                .saturating_mul(u64::from(attempt)),
        )
    }
}

/// Sleep until quota reset when a dimension is at or below its conservative
/// threshold: zero remaining requests, or <=20% remaining tokens.
async fn pace_for_quota(quota: &QuotaSnapshot, now: OffsetDateTime) {
    let wait = quota_wait(quota, now);
    if wait > Duration::ZERO {
        sleep(wait).await;
    }
}

/// Longest reset wait among depleted quota dimensions.
pub(crate) fn quota_wait(quota: &QuotaSnapshot, now: OffsetDateTime) -> Duration {
    let mut max_wait = Duration::ZERO;

    if let Some(requests) = &quota.requests {
        if requests.remaining == 0 {
            let wait = requests.until_reset(now);
            if wait > max_wait {
                info!(
                    "Request quota depleted (0/{} remaining), pacing {}ms",
                    requests.limit,
                    wait.as_millis()
                );
                max_wait = wait;
            }
        }
    }

    if let Some(tokens) = &quota.input_tokens {
        if tokens.remaining.saturating_mul(5) <= tokens.limit {
            let wait = tokens.until_reset(now);
            if wait > max_wait {
                info!(
                    "Token quota low ({}/{} remaining), pacing {}ms",
                    tokens.remaining,
                    tokens.limit,
                    wait.as_millis()
                );
                max_wait = wait;
            }
        }
    }

    max_wait
}
