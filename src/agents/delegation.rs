//! Workers exposed as delegation tools.
//!
//! An adapter turns a typed [`DelegationRequest`] into a role-specific
//! instruction, runs one worker turn and hands back the worker's final text
//! untouched. Every failure (model error, timeout, panic) becomes the error
//! marker text instead of an `Err`, so the caller's flow never unwinds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{prompts, AgentError, AgentRole, WorkerAgent};
use crate::llm::{ChatMessage, ToolDefinition};
use crate::stream::{self, EventSink, StreamEvent};
use crate::threads::ThreadId;

/// `[Error] <Role> 실행 실패: <detail>`
pub fn error_marker(role: AgentRole, detail: &str) -> String {
    format!("[Error] {} 실행 실패: {}", role.display_name(), detail)
}

pub fn is_error_marker(text: &str) -> bool {
    text.trim_start().starts_with("[Error]")
}

/// Work handed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelegationRequest {
    /// Explore a site and produce a Blueprint.
    Navigate { user_request: String },
    /// Implement a Blueprint and collect the data.
    Code {
        blueprint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_request: Option<String>,
        /// Validation problems found in the Blueprint, for the coder to
        /// report back.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        blueprint_issues: Vec<String>,
    },
    /// Analyse and chart a collected data file.
    Analyze {
        data_file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

impl DelegationRequest {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Navigate { .. } => AgentRole::Navigator,
            Self::Code { .. } => AgentRole::Coder,
            Self::Analyze { .. } => AgentRole::Analyst,
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "delegate_navigator",
            Self::Code { .. } => "delegate_coder",
            Self::Analyze { .. } => "delegate_analyst",
        }
    }

    /// Arguments in tool-call form.
    pub fn arguments(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a model-issued delegation tool call.
    pub fn from_tool_call(name: &str, args: &Value) -> anyhow::Result<Self> {
        let field = |key: &str| -> anyhow::Result<String> {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("{} requires a non-empty '{}' argument", name, key))
        };
        match name {
            "delegate_navigator" => Ok(Self::Navigate {
                user_request: field("user_request")?,
            }),
            "delegate_coder" => Ok(Self::Code {
                blueprint: field("blueprint")?,
                user_request: field("user_request").ok(),
                blueprint_issues: Vec::new(),
            }),
            "delegate_analyst" => Ok(Self::Analyze {
                data_file_path: field("data_file_path")?,
                context: field("context").ok(),
            }),
            other => Err(anyhow::anyhow!("Not a delegation tool: {}", other)),
        }
    }

    /// The instruction the worker receives.
    pub fn instruction(&self, artifact_dir: &Path) -> String {
        match self {
            Self::Navigate { user_request } => prompts::navigate_instruction(user_request),
            Self::Code {
                blueprint,
                user_request,
                blueprint_issues,
            } => prompts::code_instruction(
                blueprint,
                user_request.as_deref(),
                blueprint_issues,
                artifact_dir,
            ),
            Self::Analyze {
                data_file_path,
                context,
            } => prompts::analyze_instruction(data_file_path, context.as_deref(), artifact_dir),
        }
    }
}

/// Tool definition a model sees for delegating to `role`.
pub fn definition(role: AgentRole) -> Option<ToolDefinition> {
    let (name, description, parameters) = match role {
        AgentRole::Navigator => (
            "delegate_navigator",
            "Analyse the target website and produce a JSON Blueprint describing how to collect the data.",
            json!({
                "type": "object",
                "properties": {
                    "user_request": {"type": "string", "description": "The user's original request or collection goal."}
                },
                "required": ["user_request"]
            }),
        ),
        AgentRole::Coder => (
            "delegate_coder",
            "Write and run crawler code from a Blueprint and save the collected data to a file.",
            json!({
                "type": "object",
                "properties": {
                    "blueprint": {"type": "string", "description": "The navigator's Blueprint, verbatim."},
                    "user_request": {"type": "string", "description": "Optional extra context."}
                },
                "required": ["blueprint"]
            }),
        ),
        AgentRole::Analyst => (
            "delegate_analyst",
            "Read a collected data file, analyse it and save a chart.",
            json!({
                "type": "object",
                "properties": {
                    "data_file_path": {"type": "string", "description": "Path of the data file to analyse."},
                    "context": {"type": "string", "description": "Optional: what the analysis should focus on."}
                },
                "required": ["data_file_path"]
            }),
        ),
        AgentRole::Supervisor => return None,
    };
    Some(ToolDefinition::function(name, description, parameters))
}

/// What came back from a delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationOutcome {
    /// The worker's final text, verbatim.
    Completed(String),
    Failed { role: AgentRole, detail: String },
}

impl DelegationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The text handed back to the delegator: the worker's answer or the
    /// error marker.
    pub fn text(&self) -> String {
        match self {
            Self::Completed(text) => text.clone(),
            Self::Failed { role, detail } => error_marker(*role, detail),
        }
    }
}

/// A worker behind the delegation tool surface.
pub struct DelegationAdapter {
    worker: Arc<WorkerAgent>,
    timeout: Duration,
}

impl DelegationAdapter {
    pub fn new(worker: Arc<WorkerAgent>, timeout: Duration) -> Self {
        Self { worker, timeout }
    }

    pub fn role(&self) -> AgentRole {
        self.worker.role()
    }

    pub fn worker(&self) -> &Arc<WorkerAgent> {
        &self.worker
    }

    pub fn definition(&self) -> Option<ToolDefinition> {
        definition(self.role())
    }

    fn artifact_dir(&self) -> PathBuf {
        self.worker.artifact_dir().to_path_buf()
    }

    /// Run one worker turn for `request` on `thread_id`. Never fails.
    pub async fn delegate(
        &self,
        request: &DelegationRequest,
        thread_id: &ThreadId,
        events: Option<EventSink>,
    ) -> DelegationOutcome {
        let role = self.role();
        if request.role() != role {
            return DelegationOutcome::Failed {
                role,
                detail: format!("{} request sent to the {} adapter", request.role(), role),
            };
        }

        let instruction = request.instruction(&self.artifact_dir());
        tracing::info!(role = %role, thread = %thread_id, "Delegating {}", request.tool_name());
        stream::emit(
            events.as_ref(),
            StreamEvent::ToolStart {
                name: request.tool_name().to_string(),
                input: request.arguments(),
            },
        )
        .await;
        let outer_events = events.clone();

        let worker = self.worker.clone();
        let thread = thread_id.clone();
        // Run on its own task so a panicking worker is contained.
        let mut task = tokio::spawn(async move {
            worker
                .invoke_with_events(&thread, vec![ChatMessage::user(instruction)], events)
                .await
        });

        let result = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AgentError::Aborted(join_error.to_string())),
            Err(_) => {
                task.abort();
                Err(AgentError::Timeout(self.timeout))
            }
        };

        let outcome = match result {
            Ok(reply) => {
                if reply.budget_exhausted {
                    tracing::warn!(role = %role, "Delegated turn ran out of steps");
                }
                DelegationOutcome::Completed(reply.content().to_string())
            }
            Err(e) => {
                tracing::warn!(role = %role, "Delegation failed: {}", e);
                DelegationOutcome::Failed {
                    role,
                    detail: e.to_string(),
                }
            }
        };

        stream::emit(
            outer_events.as_ref(),
            StreamEvent::ToolEnd {
                name: request.tool_name().to_string(),
                output: outcome.text(),
            },
        )
        .await;
        outcome
    }
}
