//! Agents and the delegation pipeline.
//!
//! ```text
//!   user ──▶ SupervisorController
//!                 │  Navigate ─▶ DelegationAdapter ─▶ WorkerAgent(navigator) ─▶ browse_web
//!                 │  Code     ─▶ DelegationAdapter ─▶ WorkerAgent(coder)     ─▶ python, file search
//!                 │  Analyze  ─▶ DelegationAdapter ─▶ WorkerAgent(analyst)   ─▶ python
//!                 ▼
//!           final report (streamed)
//! ```

mod delegation;
pub mod prompts;
mod supervisor;
mod worker;

pub use delegation::{error_marker, is_error_marker, DelegationAdapter, DelegationOutcome, DelegationRequest};
pub use supervisor::{PipelineReport, StageRecord, SupervisorController};
pub use worker::{run_tool_loop, LoopOutcome, WorkerAgent, WorkerReply};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::RoleHint;

/// The agents a user can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Supervisor,
    Navigator,
    Coder,
    Analyst,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Supervisor,
        AgentRole::Navigator,
        AgentRole::Coder,
        AgentRole::Analyst,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "supervisor" => Some(Self::Supervisor),
            "navigator" => Some(Self::Navigator),
            "coder" => Some(Self::Coder),
            "analyst" => Some(Self::Analyst),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Navigator => "navigator",
            Self::Coder => "coder",
            Self::Analyst => "analyst",
        }
    }

    /// Capitalized name used in user-facing text and error markers.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Supervisor => "Supervisor",
            Self::Navigator => "Navigator",
            Self::Coder => "Coder",
            Self::Analyst => "Analyst",
        }
    }

    pub fn model_hint(&self) -> RoleHint {
        match self {
            Self::Supervisor => RoleHint::Supervisor,
            Self::Navigator => RoleHint::Navigator,
            Self::Coder => RoleHint::Coder,
            Self::Analyst => RoleHint::Analyst,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker turn produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("worker task aborted: {0}")]
    Aborted(String),
}
