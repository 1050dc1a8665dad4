pub mod builtin;
pub mod manifest;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::llm::ToolSpec;

/// Per-execution context threaded explicitly into every handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cancel,
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("tool '{0}' is not available")]
    Unavailable(String),
    #[error("no execution function is registered for approved tool '{0}'")]
    MissingExecution(String),
    #[error("tool execution was cancelled")]
    Cancelled,
    #[error("execution outcome unknown: tool '{0}' was interrupted after approval")]
    Interrupted(String),
    #[error("{0}")]
    Failed(String),
}

/// How a tool runs. Confirmation-required tools carry no handler; their
/// execution function lives in the tool set's execution table and is only
/// reachable after an approval.
#[derive(Clone)]
pub enum ToolMode {
    Auto(Arc<dyn ToolHandler>),
    RequiresConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Auto,
    RequiresConfirmation,
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub mode: ToolMode,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("class", &classify(self))
            .finish()
    }
}

impl ToolDefinition {
    pub fn auto(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            mode: ToolMode::Auto(handler),
        }
    }

    pub fn requires_confirmation(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            mode: ToolMode::RequiresConfirmation,
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

pub fn classify(tool: &ToolDefinition) -> ToolClass {
    match tool.mode {
        ToolMode::Auto(_) => ToolClass::Auto,
        ToolMode::RequiresConfirmation => ToolClass::RequiresConfirmation,
    }
}

/// Execution functions for confirmation-required tools, keyed by tool name.
pub type ExecutionTable = HashMap<String, Arc<dyn ToolHandler>>;

/// Name-keyed tool definitions plus the execution table for the
/// confirmation-required ones.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolDefinition>,
    executions: ExecutionTable,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDefinition) {
        self.executions.remove(&tool.name);
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn register_with_confirmation(
        &mut self,
        tool: ToolDefinition,
        execution: Arc<dyn ToolHandler>,
    ) {
        let name = tool.name.clone();
        let tool = ToolDefinition {
            mode: ToolMode::RequiresConfirmation,
            ..tool
        };
        self.tools.insert(name.clone(), tool);
        self.executions.insert(name, execution);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn execution(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.executions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    /// Merge `other` into this set. The incoming definition wins on a name
    /// collision, and any stale execution entry for that name is dropped
    /// before the incoming table is applied. Returns the colliding names.
    pub fn merge(&mut self, other: ToolSet) -> Vec<String> {
        let mut collisions = Vec::new();
        for (name, tool) in other.tools {
            if self.tools.contains_key(&name) {
                collisions.push(name.clone());
            }
            self.executions.remove(&name);
            self.tools.insert(name, tool);
        }
        for (name, execution) in other.executions {
            self.executions.insert(name, execution);
        }
        collisions
    }
}

/// Anything that can contribute tools to a turn.
#[async_trait]
pub trait ToolSource: Send + Sync {
    fn name(&self) -> &str;
    async fn load(&self) -> Result<ToolSet>;
}

/// A fixed, pre-built tool set.
pub struct StaticToolSource {
    name: String,
    tools: ToolSet,
}

impl StaticToolSource {
    pub fn new(name: impl Into<String>, tools: ToolSet) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

#[async_trait]
impl ToolSource for StaticToolSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<ToolSet> {
        Ok(self.tools.clone())
    }
}

/// Ordered collection of tool sources, merged last-wins on every turn.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    sources: Vec<Arc<dyn ToolSource>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, source: Arc<dyn ToolSource>) {
        info!("Registering tool source: {}", source.name());
        self.sources.push(source);
    }

    pub async fn assemble(&self) -> ToolSet {
        let mut merged = ToolSet::new();
        for source in &self.sources {
            match source.load().await {
                Ok(set) => {
                    for name in merged.merge(set) {
                        warn!(
                            "Tool '{}' from source '{}' replaces an earlier definition",
                            name,
                            source.name()
                        );
                    }
                }
                Err(e) => {
                    warn!("Skipping tool source '{}': {}", source.name(), e);
                }
            }
        }
        merged
    }
}
