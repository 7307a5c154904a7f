//! Tools the workers call.
//!
//! ## Artifact-Directory Design
//!
//! Every tool works relative to the shared artifact directory carried in
//! [`ToolContext`]:
//! - `execute_python_code` runs scripts with the artifact dir as cwd
//! - `file_search` / `grep_search` / `read_file` never leave it
//! - `browse_web` is the only tool that reaches outside the machine

mod browse;
mod file_ops;
mod python;

pub use browse::BrowseWeb;
pub use file_ops::{FileSearch, GrepSearch, ReadFile, MAX_FILE_BYTES};
pub use python::ExecutePythonCode;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ToolCall, ToolDefinition};
use crate::stream::EventSink;
use crate::threads::ThreadId;

/// What a tool knows about the call it serves.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub artifact_dir: PathBuf,
    /// Conversation the call belongs to; identifies the continuity chain
    /// for the shared browser.
    pub thread_id: ThreadId,
    pub events: Option<EventSink>,
}

impl ToolContext {
    pub fn new(artifact_dir: impl Into<PathBuf>, thread_id: ThreadId) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            thread_id,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventSink>) -> Self {
        self.events = events;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(self.name(), self.description(), self.parameters_schema())
    }
}

/// The tools one agent may call.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Add a tool, replacing one with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Run a tool call. Failures come back as text for the model to read.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        let name = call.function.name.as_str();
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            tracing::warn!("Model called unknown tool: {}", name);
            return format!(
                "Error: unknown tool '{}'. Available tools: {}",
                name,
                self.names().join(", ")
            );
        };

        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!("{}", e);
                return format!("Error: {}", e);
            }
        };

        match tool.execute(args, ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Tool {} failed: {}", name, e);
                format!("Error: {}", e)
            }
        }
    }
}

/// Resolve `path` inside `root`, rejecting anything that escapes it.
///
/// Relative paths join onto `root`; absolute paths must already lie under
/// it. `..` components are folded lexically so the check also holds for
/// files that do not exist yet.
pub fn resolve_in_root(path: &str, root: &Path) -> anyhow::Result<PathBuf> {
    let root = normalize(root);
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root.join(candidate))
    };
    if !joined.starts_with(&root) {
        anyhow::bail!(
            "Path {} is outside the artifact directory {}",
            path,
            root.display()
        );
    }
    Ok(joined)
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
