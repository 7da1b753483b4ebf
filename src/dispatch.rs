//! Tool resolution and dispatch.
//!
//! The dispatcher maps model-requested invocations onto registered
//! capability providers or the local virtual overview tool. Dispatch never
//! raises: unknown names and provider failures become textual results so
//! the loop can keep going and the model can adapt.

use crate::llm::ToolSchema;
use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::RwLock;

/// Virtual tool answered locally from the pre-computed repository overview.
pub const OVERVIEW_TOOL: &str = "get_repo_overview";

/// An external collaborator exposing named tools with schema-described
/// inputs. Tool names are unqualified here; the dispatcher namespaces them
/// as `provider:tool` when offering them to the model.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn tool_schemas(&self) -> Vec<ToolSchema>;

    /// Invoke a tool by its unqualified name.
    ///
    /// # Errors
    /// Returns an error on provider failure; the dispatcher converts it to
    /// a textual result.
    async fn call_tool(&self, tool: &str, input: &serde_json::Value) -> Result<String>;
}

/// Where a model-requested tool name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The local virtual overview tool.
    Overview,
    /// A registered provider, by index, plus the unqualified tool name.
    Provider { index: usize, tool: String },
    /// No registered tool matches.
    Unknown,
}

pub struct ToolDispatcher {
    providers: Vec<Box<dyn CapabilityProvider>>,
    /// Namespaced name -> (provider index, unqualified tool name).
    tool_map: HashMap<String, (usize, String)>,
    schemas: Vec<ToolSchema>,
    overview: RwLock<Option<String>>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            tool_map: HashMap::new(),
            schemas: vec![overview_schema()],
            overview: RwLock::new(None),
        }
    }

    /// Register a provider, namespacing its tools as `provider:tool`.
    pub fn register(&mut self, provider: Box<dyn CapabilityProvider>) {
        let index = self.providers.len();
        let mut count = 0usize;
        for schema in provider.tool_schemas() {
            let namespaced = format!("{}:{}", provider.name(), schema.name);
            self.tool_map
                .insert(namespaced.clone(), (index, schema.name.clone()));
            self.schemas.push(ToolSchema {
                name: namespaced,
                description: schema.description,
                input_schema: schema.input_schema,
            });
            count += 1;
        }
        info!("Registered provider '{}': {count} tools", provider.name());
        self.providers.push(provider);
    }

    /// The union of local and provider tool schemas offered on every turn.
    #[must_use]
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.schemas.clone()
    }

    /// Replace the pre-computed repository overview.
    pub fn set_overview(&self, overview: impl Into<String>) {
        if let Ok(mut slot) = self.overview.write() {
            *slot = Some(overview.into());
        }
    }

    /// Pure lookup from a namespaced name to its resolution.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Resolution {
        if name == OVERVIEW_TOOL {
            return Resolution::Overview;
        }
        match self.tool_map.get(name) {
            Some((index, tool)) => Resolution::Provider {
                index: *index,
                tool: tool.clone(),
            },
            None => Resolution::Unknown,
        }
    }

    /// Dispatch one invocation and return its textual result. Never errors.
    pub async fn dispatch(&self, name: &str, input: &serde_json::Value) -> String {
        match self.resolve(name) {
            Resolution::Overview => self
                .overview
                .read()
                .ok()
                .and_then(|slot| slot.clone())
                .unwrap_or_else(|| "(overview not available)".to_string()),
            Resolution::Provider { index, tool } => {
                match self.providers[index].call_tool(&tool, input).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Tool '{name}' failed: {e:#}");
                        format!("tool error: {e:#}")
                    }
                }
            }
            Resolution::Unknown => {
                warn!("Model called unknown tool: {name}");
                format!(
                    "Error: unknown tool '{name}'. Use one of the tools listed in your tool definitions."
                )
            }
        }
    }
}

/// The `path` argument of a file-reading invocation, for files-consulted
/// tracking.
#[must_use]
pub fn consulted_file(name: &str, input: &serde_json::Value) -> Option<String> {
    let short = name.rsplit(':').next().unwrap_or(name);
    if short != "read_file" {
        return None;
    }
    input
        .get("path")
        .or_else(|| input.get("file_path"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn overview_schema() -> ToolSchema {
    ToolSchema {
        name: OVERVIEW_TOOL.to_string(),
        description: "Returns a pre-computed overview of every file, class, function, and \
                      type in the repository. Call this FIRST to orient yourself before \
                      using any other tool."
            .to_string(),
        input_schema: serde_json::json!({"type": "object", "properties": {}, "required": []}),
    }
}
