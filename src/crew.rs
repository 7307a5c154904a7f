//! Wiring: models, tools, workers and the supervisor built from [`Config`].

use std::sync::Arc;

use crate::agents::{prompts, AgentError, AgentRole, DelegationAdapter, SupervisorController, WorkerAgent};
use crate::browser::{BrowserLauncher, LeaseError, SharedBrowser};
use crate::config::{Config, SupervisorStages};
use crate::llm::{ChatMessage, ModelOverrides, ModelResolver, ResolveError, RoleHint};
use crate::stream::{EventSink, StreamEvent};
use crate::threads::ThreadId;
use crate::tools::{BrowseWeb, ExecutePythonCode, FileSearch, GrepSearch, ReadFile, ToolRegistry};

/// The browser backend compiled into this build.
pub fn default_launcher() -> Arc<dyn BrowserLauncher> {
    #[cfg(feature = "browser")]
    {
        Arc::new(crate::browser::ChromiumLauncher)
    }
    #[cfg(not(feature = "browser"))]
    {
        Arc::new(crate::browser::HttpLauncher::default())
    }
}

/// Every agent of the server, ready to chat.
pub struct Crew {
    config: Config,
    browser: Arc<SharedBrowser>,
    navigator: Arc<WorkerAgent>,
    coder: Arc<WorkerAgent>,
    analyst: Arc<WorkerAgent>,
    supervisor: SupervisorController,
}

impl Crew {
    /// Resolve one model per role and assemble the agents.
    pub fn build(
        config: Config,
        resolver: &ModelResolver,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, ResolveError> {
        let overrides = ModelOverrides::default();
        let dir = config.artifact_dir.clone();
        let browser = Arc::new(SharedBrowser::new(launcher, config.browser.clone()));

        let browse = BrowseWeb::new(
            browser.clone(),
            resolver.resolve(RoleHint::Browser, &overrides)?,
            config.browser_max_steps,
        );
        let python = Arc::new(ExecutePythonCode::new(config.python_bin.clone(), config.tool_timeout));

        let navigator = Arc::new(WorkerAgent::new(
            AgentRole::Navigator,
            prompts::navigator_persona(),
            resolver.resolve(RoleHint::Navigator, &overrides)?,
            ToolRegistry::new().with(Arc::new(browse)),
            config.max_worker_steps,
            dir.clone(),
        ));
        let coder = Arc::new(WorkerAgent::new(
            AgentRole::Coder,
            prompts::coder_persona(&dir),
            resolver.resolve(RoleHint::Coder, &overrides)?,
            ToolRegistry::new()
                .with(python.clone())
                .with(Arc::new(FileSearch))
                .with(Arc::new(GrepSearch))
                .with(Arc::new(ReadFile)),
            config.max_worker_steps,
            dir.clone(),
        ));
        let analyst = Arc::new(WorkerAgent::new(
            AgentRole::Analyst,
            prompts::analyst_persona(&dir),
            resolver.resolve(RoleHint::Analyst, &overrides)?,
            ToolRegistry::new().with(python),
            config.max_worker_steps,
            dir.clone(),
        ));

        let adapter = |worker: &Arc<WorkerAgent>| DelegationAdapter::new(worker.clone(), config.delegation_timeout);
        let supervisor = SupervisorController::new(
            resolver.resolve(RoleHint::Supervisor, &overrides)?,
            adapter(&navigator),
            adapter(&coder),
            (config.stages == SupervisorStages::Full).then(|| adapter(&analyst)),
            dir,
            config.stage_attempts,
        );

        tracing::info!(
            artifact_dir = %config.artifact_dir.display(),
            stages = ?config.stages,
            "Agents ready"
        );

        Ok(Self {
            config,
            browser,
            navigator,
            coder,
            analyst,
            supervisor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn browser(&self) -> &Arc<SharedBrowser> {
        &self.browser
    }

    pub fn supervisor(&self) -> &SupervisorController {
        &self.supervisor
    }

    pub fn worker(&self, role: AgentRole) -> Option<&Arc<WorkerAgent>> {
        match role {
            AgentRole::Navigator => Some(&self.navigator),
            AgentRole::Coder => Some(&self.coder),
            AgentRole::Analyst => Some(&self.analyst),
            AgentRole::Supervisor => None,
        }
    }

    /// One chat turn with `role`. The answer is also sent as token events.
    pub async fn chat(
        &self,
        role: AgentRole,
        thread_id: &ThreadId,
        message: &str,
        events: Option<EventSink>,
    ) -> Result<String, AgentError> {
        let Some(worker) = self.worker(role) else {
            let report = self.supervisor.run_streaming(thread_id, message, events).await;
            return Ok(report.final_text);
        };

        let messages = if message.trim().is_empty() {
            Vec::new()
        } else {
            vec![ChatMessage::user(message)]
        };
        let reply = worker
            .invoke_with_events(thread_id, messages, events.clone())
            .await?;
        let content = reply.content().to_string();
        if let Some(sink) = &events {
            sink.emit(StreamEvent::token(content.clone())).await;
        }
        Ok(content)
    }

    /// Forget `thread_id` for `role`. The supervisor also clears the
    /// worker threads it drove. A shared browser session held by the
    /// conversation is closed with it.
    pub async fn reset(&self, role: AgentRole, thread_id: &ThreadId) -> bool {
        let existed = match self.worker(role) {
            Some(worker) => worker.threads().reset(thread_id).await,
            None => self.supervisor.reset(thread_id).await,
        };
        if matches!(role, AgentRole::Supervisor | AgentRole::Navigator) {
            match self.browser.release(thread_id.as_str()).await {
                Ok(()) => tracing::info!(thread = %thread_id, "Released shared browser on reset"),
                Err(LeaseError::NotHolder { .. }) => {}
                Err(e) => tracing::warn!(thread = %thread_id, "Browser release failed: {}", e),
            }
        }
        existed
    }

    /// Close the shared browser if a session is open.
    pub async fn shutdown(&self) {
        if let Some(holder) = self.browser.teardown().await {
            tracing::info!(holder = %holder, "Closed shared browser on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scripted_crew as build_crew, text, ScriptedLlm};

    #[tokio::test]
    async fn test_workers_get_their_tools() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let crew = build_crew(&llm, SupervisorStages::Full);

        let names = |role| crew.worker(role).unwrap().tools().names();
        assert_eq!(names(AgentRole::Navigator), vec!["browse_web"]);
        assert_eq!(
            names(AgentRole::Coder),
            vec!["execute_python_code", "file_search", "grep_search", "read_file"]
        );
        assert_eq!(names(AgentRole::Analyst), vec!["execute_python_code"]);
        assert!(crew.worker(AgentRole::Supervisor).is_none());
        assert_eq!(crew.supervisor().adapters().len(), 3);

        let collect = build_crew(&llm, SupervisorStages::Collect);
        assert_eq!(collect.supervisor().adapters().len(), 2);
    }

    #[tokio::test]
    async fn test_chat_and_reset_worker_thread() {
        let llm = Arc::new(ScriptedLlm::new(vec![text("hello from coder")]));
        let crew = build_crew(&llm, SupervisorStages::Full);
        let id = ThreadId::new("t");
        let (sink, mut rx) = EventSink::channel(8);

        let answer = crew.chat(AgentRole::Coder, &id, "hi", Some(sink)).await.unwrap();
        assert_eq!(answer, "hello from coder");
        assert_eq!(rx.recv().await, Some(StreamEvent::token("hello from coder")));

        // Empty follow-up replays the last answer without a model call.
        let again = crew.chat(AgentRole::Coder, &id, "  ", None).await.unwrap();
        assert_eq!(again, "hello from coder");
        assert_eq!(llm.calls(), 1);

        assert!(crew.reset(AgentRole::Coder, &id).await);
        assert!(!crew.reset(AgentRole::Coder, &id).await);
    }

    #[tokio::test]
    async fn test_reset_releases_browser_held_by_thread() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let crew = build_crew(&llm, SupervisorStages::Full);
        let old = ThreadId::new("old-thread");

        crew.browser().try_acquire(old.as_str()).await.unwrap();
        crew.reset(AgentRole::Supervisor, &old).await;
        let lease = crew.browser().try_acquire("new-thread").await.unwrap();
        assert_eq!(lease.holder(), "new-thread");

        // Resetting someone else's thread leaves the holder alone.
        crew.reset(AgentRole::Navigator, &old).await;
        assert!(matches!(
            crew.browser().try_acquire("other").await,
            Err(LeaseError::Held { holder }) if holder == "new-thread"
        ));
    }

    #[tokio::test]
    async fn test_model_failure_surfaces_as_error() {
        let llm = Arc::new(ScriptedLlm::failing("no quota"));
        let crew = build_crew(&llm, SupervisorStages::Full);
        let err = crew
            .chat(AgentRole::Analyst, &ThreadId::new("t"), "go", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no quota"));
    }
}
