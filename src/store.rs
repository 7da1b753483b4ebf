//! Conversation state: history, TTL sweep, response cache, admission.
//!
//! The store exclusively owns every conversation record and cache entry.
//! For the duration of one run it lends the current message buffer to the
//! agent loop, which appends turns in place; the buffer is reinserted on
//! every exit path, repaired first if the run died mid-turn, so the next
//! call for the same conversation always starts from valid state.

use crate::agent::{AgentLoop, StepSink, TextSink};
use crate::dispatch::ToolDispatcher;
use crate::llm::{Message, ModelProvider, Role};
use crate::types::{AgentConfig, RunOutcome, StoreConfig};
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

struct ConversationRecord {
    messages: Vec<Message>,
    last_access: Instant,
}

struct CacheEntry {
    answer: String,
    created: Instant,
}

pub struct ConversationStore<P> {
    agent: AgentLoop<P>,
    dispatcher: Arc<ToolDispatcher>,
    semaphore: Semaphore,
    config: StoreConfig,
    conversations: Mutex<HashMap<String, ConversationRecord>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl<P: ModelProvider> ConversationStore<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        dispatcher: Arc<ToolDispatcher>,
        agent_config: AgentConfig,
        config: StoreConfig,
    ) -> Self {
        Self {
            agent: AgentLoop::new(provider, agent_config),
            dispatcher,
            semaphore: Semaphore::new(config.max_concurrency),
            config,
            conversations: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ask a question, optionally continuing an existing conversation.
    pub async fn ask(
        &self,
        question: &str,
        conversation_id: Option<&str>,
        text_sink: Option<&dyn TextSink>,
        step_sink: Option<&dyn StepSink>,
    ) -> Result<RunOutcome> {
        self.sweep_expired();

        // Cache check happens strictly before any history mutation so a hit
        // leaves stored history untouched.
        let stateless = match conversation_id {
            None => true,
            Some(cid) => !self
                .conversations
                .lock()
                .map(|map| map.contains_key(cid))
                .unwrap_or(false),
        };
        if stateless {
            if let Some(answer) = self.cached_answer(question) {
                info!("Response cache hit");
                return Ok(RunOutcome {
                    answer,
                    files_consulted: Vec::new(),
                });
            }
        }

        // Take ownership of the record's buffer for the duration of the run.
        let mut messages = conversation_id
            .and_then(|cid| {
                self.conversations
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(cid))
                    .map(|record| record.messages)
            })
            .unwrap_or_default();
        messages.push(Message::user(question));

        if !alternation_valid(&messages) {
            warn!(
                "Discarding malformed history ({} msgs) for conversation {:?}",
                messages.len() - 1,
                conversation_id
            );
            messages = vec![Message::user(question)];
        }

        truncate_history(&mut messages, self.config.max_history_messages);

        info!(
            "Question (conversation={}, history={} msgs): {question}",
            conversation_id.unwrap_or("none"),
            messages.len()
        );

        let result = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .context("admission semaphore closed")?;
            self.agent
                .run(&mut messages, &self.dispatcher, text_sink, step_sink)
                .await
        };

        match result {
            Ok(outcome) => {
                if let Some(cid) = conversation_id {
                    self.store_record(cid, messages);
                } else {
                    self.cache_answer(question, &outcome.answer);
                }
                Ok(outcome)
            }
            Err(e) => {
                // The run mutated history in place; trim the dangling tail so
                // the next call starts from valid state, then re-raise.
                repair_tail(&mut messages);
                if let Some(cid) = conversation_id {
                    self.store_record(cid, messages);
                }
                Err(e)
            }
        }
    }

    fn store_record(&self, conversation_id: &str, messages: Vec<Message>) {
        if let Ok(mut map) = self.conversations.lock() {
            map.insert(
                conversation_id.to_string(),
                ConversationRecord {
                    messages,
                    last_access: Instant::now(),
                },
            );
        }
    }

    fn cached_answer(&self, question: &str) -> Option<String> {
        let key = normalize_question(question);
        let ttl = Duration::from_secs(self.config.response_cache_ttl_secs);
        self.cache.lock().ok().and_then(|map| {
            map.get(&key)
                .filter(|entry| entry.created.elapsed() <= ttl)
                .map(|entry| entry.answer.clone())
        })
    }

    fn cache_answer(&self, question: &str, answer: &str) {
        if let Ok(mut map) = self.cache.lock() {
            map.insert(
                normalize_question(question),
                CacheEntry {
                    answer: answer.to_string(),
                    created: Instant::now(),
                },
            );
        }
    }

    /// Lazy, on-access removal of expired state. No background timer.
    fn sweep_expired(&self) {
        let conversation_ttl = Duration::from_secs(self.config.conversation_ttl_secs);
        if let Ok(mut map) = self.conversations.lock() {
            let before = map.len();
            map.retain(|_, record| record.last_access.elapsed() <= conversation_ttl);
            let swept = before - map.len();
            if swept > 0 {
                info!("Cleaned up {swept} expired conversations");
            }
        }

        let cache_ttl = Duration::from_secs(self.config.response_cache_ttl_secs);
        if let Ok(mut map) = self.cache.lock() {
            map.retain(|_, entry| entry.created.elapsed() <= cache_ttl);
        }
    }

    #[cfg(test)]
    fn stored_history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.conversations
            .lock()
            .ok()
            .and_then(|map| map.get(conversation_id).map(|r| r.messages.clone()))
    }
}

pub(crate) fn normalize_question(question: &str) -> String {
    question.trim().to_lowercase()
}

/// A valid history strictly alternates `user`, `assistant`, ... starting
/// with `user`.
pub(crate) fn alternation_valid(messages: &[Message]) -> bool {
    messages.iter().enumerate().all(|(i, m)| {
        let expected = if i % 2 == 0 {
            Role::User
        } else {
            Role::Assistant
        };
        m.role == expected
    })
}

/// Cap history length, keeping the first message for long-range context and
/// an even-length recent tail so alternation survives the cut.
pub(crate) fn truncate_history(messages: &mut Vec<Message>, cap: usize) {
    if cap == 0 || messages.len() <= cap {
        return;
    }
    let mut keep = cap.saturating_sub(1);
    if keep % 2 != 0 {
        keep -= 1;
    }
    let tail_start = messages.len() - keep;
    let mut truncated = Vec::with_capacity(keep + 1);
    truncated.push(messages[0].clone());
    truncated.extend_from_slice(&messages[tail_start..]);
    *messages = truncated;
}

/// Pop trailing messages left by a crashed run until the history ends on a
/// completed assistant turn (no pending tool-invocation blocks) or is empty.
pub(crate) fn repair_tail(messages: &mut Vec<Message>) {
    while let Some(last) = messages.last() {
        let dangling = match last.role {
            // A trailing user turn is either tool results with no terminal
            // answer, or the question of an aborted run.
            Role::User => true,
            Role::Assistant => last.has_tool_use(),
        };
        if !dangling {
            break;
        }
        messages.pop();
    }
}
