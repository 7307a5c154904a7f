//! API request and response types.

use serde::{Deserialize, Serialize};

/// Body of the stream and invoke endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Continue this conversation; a new id is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub agent: String,
    pub thread_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub agents: Vec<String>,
    /// `full` or `collect`.
    pub stages: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub agent: String,
    pub thread_id: String,
    /// The thread had history before the reset.
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserTeardownResponse {
    pub closed: bool,
    /// Conversation that held the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}
