pub mod types;

pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Boundary to the reasoning model.
///
/// Implementations classify transient provider pressure (rate limits,
/// overload) into [`ChatOutcome`] variants rather than raising, so the
/// retrying client can decide what to do. Transport failures are `Err`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome>;
    fn model(&self) -> &str;
    fn provider(&self) -> &'static str;
}
