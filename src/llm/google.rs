//! Google Gemini client (`generateContent` REST API) with function calling.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;

use super::error::{LlmError, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, Role, TokenUsage, ToolCall, ToolDefinition};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini API client.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_config: RetryConfig,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_API_BASE.to_string(),
            retry_config: RetryConfig::default(),
        }
    }

    async fn execute_request(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::network_error(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, None));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;
        parsed.into_chat_response(model)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.chat_completion_with_options(model, messages, tools, ChatOptions::default())
            .await
    }

    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = GenerateRequest::build(messages, tools, &options);
        tracing::debug!("Sending generateContent: model={}", model);

        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.execute_request(model, &request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    if !self.retry_config.should_retry(&error)
                        || attempt >= self.retry_config.max_retries
                        || remaining.is_zero()
                    {
                        tracing::error!("Gemini request failed: {}", error);
                        return Err(anyhow::anyhow!("{}", error));
                    }
                    let delay = error.suggested_delay(attempt).min(remaining);
                    tracing::warn!("Gemini attempt {} failed, retrying in {:?}: {}", attempt + 1, delay, error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    generation_config: serde_json::Map<String, Value>,
}

impl GenerateRequest {
    fn build(messages: &[ChatMessage], tools: Option<&[ToolDefinition]>, options: &ChatOptions) -> Self {
        let mut system = Vec::new();
        let mut contents: Vec<Content> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    if let Some(text) = message.text_content() {
                        system.push(Part::text(text));
                    }
                }
                Role::User => push_part(&mut contents, "user", Part::text(message.text_content().unwrap_or_default())),
                Role::Assistant => {
                    if let Some(text) = message.text_content().filter(|t| !t.is_empty()) {
                        push_part(&mut contents, "model", Part::text(text));
                    }
                    for call in message.tool_calls.iter().flatten() {
                        let args = call.parsed_arguments().unwrap_or_else(|_| json!({}));
                        push_part(
                            &mut contents,
                            "model",
                            Part {
                                function_call: Some(json!({ "name": call.function.name, "args": args })),
                                thought_signature: call.thought_signature.clone(),
                                ..Default::default()
                            },
                        );
                    }
                }
                Role::Tool => {
                    let name = message.tool_name.clone().unwrap_or_else(|| "tool".to_string());
                    push_part(
                        &mut contents,
                        "user",
                        Part {
                            function_response: Some(json!({
                                "name": name,
                                "response": { "content": message.text_content().unwrap_or_default() }
                            })),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let tools = match tools {
            Some(defs) if !defs.is_empty() => {
                let declarations: Vec<Value> = defs
                    .iter()
                    .map(|d| {
                        json!({
                            "name": d.function.name,
                            "description": d.function.description,
                            "parameters": d.function.parameters,
                        })
                    })
                    .collect();
                vec![json!({ "functionDeclarations": declarations })]
            }
            _ => Vec::new(),
        };

        let mut generation_config = options.extra.clone();
        if let Some(t) = options.temperature {
            generation_config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = options.top_p {
            generation_config.insert("topP".to_string(), json!(p));
        }
        if let Some(m) = options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(m));
        }

        Self {
            contents,
            system_instruction: (!system.is_empty()).then(|| Content {
                role: None,
                parts: system,
            }),
            tools,
            generation_config,
        }
    }
}

/// Append a part, merging consecutive parts of the same role into one turn.
fn push_part(contents: &mut Vec<Content>, role: &str, part: Part) {
    if let Some(last) = contents.last_mut() {
        if last.role.as_deref() == Some(role) {
            last.parts.push(part);
            return;
        }
    }
    contents.push(Content {
        role: Some(role.to_string()),
        parts: vec![part],
    });
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GenerateResponse {
    fn into_chat_response(self, model: &str) -> Result<ChatResponse, LlmError> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No candidates in response".to_string()))?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for (i, part) in candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
        {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(fc) = part.function_call {
                let name = fc["name"].as_str().unwrap_or_default().to_string();
                let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                let mut call = ToolCall::new(format!("call_{}_{}", i, name), name, args.to_string());
                call.thought_signature = part.thought_signature;
                calls.push(call);
            }
        }

        Ok(ChatResponse {
            content: (!text.is_empty()).then_some(text),
            tool_calls: (!calls.is_empty()).then_some(calls),
            finish_reason: candidate.finish_reason,
            usage: self
                .usage_metadata
                .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count)),
            model: self.model_version.or_else(|| Some(model.to_string())),
        })
    }
}
