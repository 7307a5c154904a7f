//! Worker agents: persona + model + tools + own thread store.

use std::path::PathBuf;

use serde_json::Value;

use super::{AgentError, AgentRole};
use crate::llm::{ChatMessage, ModelHandle, Role, ToolDefinition};
use crate::stream::{self, EventSink, StreamEvent};
use crate::threads::{ThreadId, ThreadStore};
use crate::tools::{ToolContext, ToolRegistry};

/// Result of a bounded tool loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Messages produced by the loop, in order (assistant and tool messages).
    pub new_messages: Vec<ChatMessage>,
    /// Text of the last assistant message that had any.
    pub answer: String,
    /// Model calls made.
    pub steps: usize,
    /// The loop stopped because it ran out of steps.
    pub exhausted: bool,
}

/// Drive `model` until it answers without tool calls or `max_steps` model
/// calls have been made. Tool failures are fed back as tool output; only a
/// failing model call is an error.
pub async fn run_tool_loop(
    model: &ModelHandle,
    mut conversation: Vec<ChatMessage>,
    tools: &ToolRegistry,
    ctx: &ToolContext,
    max_steps: usize,
) -> anyhow::Result<LoopOutcome> {
    let definitions: Vec<ToolDefinition> = tools.definitions();
    let tool_defs = (!definitions.is_empty()).then_some(definitions.as_slice());
    let events = ctx.events.as_ref();

    let mut new_messages = Vec::new();
    let mut answer = String::new();

    for step in 1..=max_steps {
        let response = model.chat(&conversation, tool_defs).await?;
        let message = response.into_message();

        if let Some(text) = message.text_content().filter(|t| !t.trim().is_empty()) {
            answer = text.to_string();
        }

        let calls = message.tool_calls.clone().unwrap_or_default();
        conversation.push(message.clone());
        new_messages.push(message);

        if calls.is_empty() {
            return Ok(LoopOutcome {
                new_messages,
                answer,
                steps: step,
                exhausted: false,
            });
        }

        for call in &calls {
            let input = call.parsed_arguments().unwrap_or(Value::Null);
            stream::emit(
                events,
                StreamEvent::ToolStart {
                    name: call.function.name.clone(),
                    input,
                },
            )
            .await;

            let output = tools.execute(call, ctx).await;

            stream::emit(
                events,
                StreamEvent::ToolEnd {
                    name: call.function.name.clone(),
                    output: output.clone(),
                },
            )
            .await;

            let result = ChatMessage::tool_result(call, output);
            conversation.push(result.clone());
            new_messages.push(result);
        }
    }

    Ok(LoopOutcome {
        new_messages,
        answer,
        steps: max_steps,
        exhausted: true,
    })
}

/// What a worker turn produced.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    /// The final assistant message of the turn.
    pub message: ChatMessage,
    /// Messages appended to the thread by this turn.
    pub appended: usize,
    pub steps: usize,
    pub budget_exhausted: bool,
}

impl WorkerReply {
    pub fn content(&self) -> &str {
        self.message.text_content().unwrap_or_default()
    }
}

/// A persona bound to a model, a tool set and its own conversation threads.
pub struct WorkerAgent {
    role: AgentRole,
    persona: String,
    model: ModelHandle,
    tools: ToolRegistry,
    threads: ThreadStore,
    max_steps: usize,
    artifact_dir: PathBuf,
}

impl WorkerAgent {
    pub fn new(
        role: AgentRole,
        persona: impl Into<String>,
        model: ModelHandle,
        tools: ToolRegistry,
        max_steps: usize,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            role,
            persona: persona.into(),
            model,
            tools,
            threads: ThreadStore::new(),
            max_steps: max_steps.max(1),
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn artifact_dir(&self) -> &std::path::Path {
        &self.artifact_dir
    }

    pub async fn invoke(
        &self,
        thread_id: &ThreadId,
        messages: Vec<ChatMessage>,
    ) -> Result<WorkerReply, AgentError> {
        self.invoke_with_events(thread_id, messages, None).await
    }

    /// Run one turn on `messages` and append the turn to the thread.
    ///
    /// With no new messages nothing is appended and no model call is made;
    /// the thread's last assistant message is returned as is. A turn that
    /// fails or is cancelled leaves the thread untouched.
    pub async fn invoke_with_events(
        &self,
        thread_id: &ThreadId,
        messages: Vec<ChatMessage>,
        events: Option<EventSink>,
    ) -> Result<WorkerReply, AgentError> {
        let _turn = self.threads.lock_turn(thread_id).await;

        if messages.is_empty() {
            let history = self.threads.history(thread_id).await;
            let message = history
                .into_iter()
                .rev()
                .find(|m| m.role == Role::Assistant && m.text_content().is_some())
                .unwrap_or_else(|| ChatMessage::assistant(""));
            return Ok(WorkerReply {
                message,
                appended: 0,
                steps: 0,
                budget_exhausted: false,
            });
        }

        // Personas are never stored; history holds only the conversation.
        let incoming = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect::<Vec<_>>();
        let mut appended = incoming.len();

        let mut conversation = vec![ChatMessage::system(self.persona.clone())];
        conversation.extend(self.threads.history(thread_id).await);
        conversation.extend(incoming.iter().cloned());

        tracing::info!(
            role = %self.role,
            thread = %thread_id,
            history = conversation.len() - 1,
            "Worker turn started"
        );

        let ctx = ToolContext::new(self.artifact_dir.clone(), thread_id.clone()).with_events(events);
        let outcome = run_tool_loop(&self.model, conversation, &self.tools, &ctx, self.max_steps)
            .await
            .map_err(|e| {
                tracing::warn!(role = %self.role, thread = %thread_id, "Worker turn failed: {}", e);
                AgentError::Model(e.to_string())
            })?;

        // The whole turn lands at once, only after it succeeded.
        self.threads.extend(thread_id, incoming).await;
        appended += outcome.new_messages.len();
        let last_is_answer = outcome
            .new_messages
            .last()
            .map_or(false, |m| m.role == Role::Assistant && !m.requests_tools());
        self.threads.extend(thread_id, outcome.new_messages).await;

        let message = if last_is_answer {
            ChatMessage::assistant(outcome.answer.clone())
        } else {
            // Out of steps mid tool use: close the turn with the partial answer.
            tracing::warn!(
                role = %self.role,
                thread = %thread_id,
                "Step budget of {} exhausted",
                self.max_steps
            );
            let text = if outcome.answer.is_empty() {
                format!(
                    "Stopped after {} steps without a final answer.",
                    outcome.steps
                )
            } else {
                outcome.answer.clone()
            };
            let closing = ChatMessage::assistant(text);
            self.threads.append(thread_id, closing.clone()).await;
            appended += 1;
            closing
        };

        tracing::info!(
            role = %self.role,
            thread = %thread_id,
            steps = outcome.steps,
            "Worker turn finished"
        );

        Ok(WorkerReply {
            message,
            appended,
            steps: outcome.steps,
            budget_exhausted: outcome.exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{text, tool_call, ScriptedLlm};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    fn worker(llm: &Arc<ScriptedLlm>, max_steps: usize) -> WorkerAgent {
        WorkerAgent::new(
            AgentRole::Coder,
            "You are a coder.",
            llm.handle(),
            ToolRegistry::new().with(Arc::new(Fails)),
            max_steps,
            "/tmp/artifacts",
        )
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_tool_output() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call("flaky", json!({})),
            text("The tool failed, here is what I know."),
        ]));
        let agent = worker(&llm, 5);
        let id = ThreadId::new("t");

        let reply = agent.invoke(&id, vec![ChatMessage::user("go")]).await.unwrap();
        assert_eq!(reply.content(), "The tool failed, here is what I know.");
        assert!(!reply.budget_exhausted);

        let history = agent.threads().history(&id).await;
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(history[2].text_content(), Some("Error: disk on fire"));

        // Persona goes first on every call but is never stored.
        let requests = llm.requests();
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert_eq!(requests[0].tools, vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_empty_invoke_is_idempotent() {
        let llm = Arc::new(ScriptedLlm::new(vec![text("first answer")]));
        let agent = worker(&llm, 5);
        let id = ThreadId::new("t");
        agent.invoke(&id, vec![ChatMessage::user("hi")]).await.unwrap();
        let before = agent.threads().history(&id).await;

        let reply = agent.invoke(&id, Vec::new()).await.unwrap();
        assert_eq!(reply.content(), "first answer");
        assert_eq!(reply.appended, 0);
        assert_eq!(agent.threads().history(&id).await, before);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_partial() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call("flaky", json!({})),
            tool_call("flaky", json!({})),
        ]));
        let agent = worker(&llm, 2);
        let id = ThreadId::new("t");

        let reply = agent.invoke(&id, vec![ChatMessage::user("loop")]).await.unwrap();
        assert!(reply.budget_exhausted);
        assert_eq!(reply.content(), "Stopped after 2 steps without a final answer.");
        let history = agent.threads().history(&id).await;
        assert_eq!(history.last().map(|m| m.role), Some(Role::Assistant));
        assert_eq!(reply.appended, history.len());
    }

    #[tokio::test]
    async fn test_model_failure_is_an_agent_error() {
        let llm = Arc::new(ScriptedLlm::failing("quota exceeded"));
        let agent = worker(&llm, 3);
        let err = agent
            .invoke(&ThreadId::new("t"), vec![ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(ref m) if m.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_thread_untouched() {
        let llm = Arc::new(ScriptedLlm::with_results(vec![
            Ok(tool_call("flaky", json!({}))),
            Err("connection reset".to_string()),
            Ok(text("second try worked")),
        ]));
        let agent = worker(&llm, 5);
        let id = ThreadId::new("t");

        assert!(agent.invoke(&id, vec![ChatMessage::user("first")]).await.is_err());
        assert!(agent.threads().history(&id).await.is_empty());

        let reply = agent.invoke(&id, vec![ChatMessage::user("again")]).await.unwrap();
        assert_eq!(reply.content(), "second try worked");
        let history = agent.threads().history(&id).await;
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(history[0].text_content(), Some("again"));
        // The retry does not resend the failed turn.
        assert_eq!(llm.requests()[2].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_events_report_inner_tools() {
        let llm = Arc::new(ScriptedLlm::new(vec![tool_call("flaky", json!({"a": 1})), text("ok")]));
        let agent = worker(&llm, 3);
        let (sink, mut rx) = EventSink::channel(16);

        agent
            .invoke_with_events(&ThreadId::new("t"), vec![ChatMessage::user("x")], Some(sink))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::ToolStart {
                name: "flaky".into(),
                input: json!({"a": 1})
            })
        );
        assert!(matches!(rx.recv().await, Some(StreamEvent::ToolEnd { ref output, .. }) if output == "Error: disk on fire"));
    }
}
