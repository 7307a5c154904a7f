//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over LLM providers:
//! an OpenAI-compatible chat-completions client and a Google Gemini client.
//! [`ModelResolver`] decides which of them backs a given agent role.

mod error;
mod google;
mod openai;
pub mod resolver;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use google::GeminiClient;
pub use openai::OpenAiClient;
pub use resolver::{
    EnvModelFactory, ModelConfig, ModelFactory, ModelHandle, ModelOverrides, ModelResolver, ModelSource,
    ModelSpec, Provider, ResolveError, RoleHint,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a chat conversation.
///
/// Messages are immutable once appended to a thread; the constructors below
/// are the only way the crate builds them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced a `Tool` message. Gemini needs it to
    /// pair function responses; the OpenAI wire format does not carry it.
    #[serde(skip)]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls (content may be empty).
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.filter(|c| !c.is_empty()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Result of executing one tool call.
    pub fn tool_result(call: &ToolCall, output: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(output.into()),
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.function.name.clone()),
        }
    }

    /// Get the text content of this message.
    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Whether this assistant message asks for tools to run.
    pub fn requests_tools(&self) -> bool {
        self.tool_calls.as_ref().map_or(false, |c| !c.is_empty())
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
    /// Gemini thought signature that must be echoed back with the call.
    #[serde(skip)]
    pub thought_signature: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            thought_signature: None,
        }
    }

    /// Parse the JSON arguments; empty arguments are an empty object.
    pub fn parsed_arguments(&self) -> anyhow::Result<serde_json::Value> {
        if self.function.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.function.arguments).map_err(|e| {
            anyhow::anyhow!(
                "Invalid arguments for {}: {} ({})",
                self.function.name,
                e,
                self.function.arguments
            )
        })
    }
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty or missing for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

impl ChatResponse {
    /// Convert the response into the assistant message to append to history.
    pub fn into_message(self) -> ChatMessage {
        match self.tool_calls {
            Some(calls) if !calls.is_empty() => ChatMessage::assistant_tool_calls(self.content, calls),
            _ => ChatMessage::assistant(self.content.unwrap_or_default()),
        }
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
    /// Provider-specific parameters merged into the request body as-is.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse>;

    /// Send a chat completion request with optional parameters.
    ///
    /// Default implementation ignores options and calls `chat_completion`.
    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        _options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        self.chat_completion(model, messages, tools).await
    }

    /// Stream a text-only completion, sending content deltas on `tx` and
    /// returning the full text.
    ///
    /// Default implementation performs one blocking call and sends the whole
    /// answer as a single delta.
    async fn stream_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> anyhow::Result<String> {
        let response = self
            .chat_completion_with_options(model, messages, None, options)
            .await?;
        let text = response.content.unwrap_or_default();
        if !text.is_empty() {
            let _ = tx.send(text.clone()).await;
        }
        Ok(text)
    }
}
