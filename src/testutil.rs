//! Test doubles: a scripted model and an in-memory browser.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::api::{router, AppState};
use crate::browser::{
    BrowserBackend, BrowserLauncher, BrowserOptions, PageId, PageSnapshot,
};
use crate::config::{Config, SupervisorStages};
use crate::crew::Crew;
use crate::llm::{
    ChatMessage, ChatResponse, LlmClient, ModelConfig, ModelFactory, ModelHandle, ModelResolver,
    ModelSource, Provider, ResolveError, ToolCall, ToolDefinition,
};

/// One request seen by a [`ScriptedLlm`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

impl RecordedRequest {
    /// Text of the last user message.
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::llm::Role::User)
            .and_then(|m| m.text_content())
            .unwrap_or_default()
            .to_string()
    }
}

/// Model that replays queued responses in order and records requests.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ChatResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Model whose every call fails.
    pub fn failing(message: &str) -> Self {
        Self::with_results(vec![Err(message.to_string()); 16])
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn handle(self: &Arc<Self>) -> ModelHandle {
        ModelHandle::new(
            self.clone(),
            ModelConfig {
                provider: Provider::OpenAi,
                model_name: "scripted".to_string(),
                temperature: Some(0.0),
                extra: Map::new(),
            },
            ModelSource::Override,
        )
    }
}

/// Factory handing the same scripted model to every role.
pub struct FixedFactory(pub Arc<ScriptedLlm>);

impl ModelFactory for FixedFactory {
    fn build(&self, _config: &ModelConfig) -> Result<Arc<dyn LlmClient>, ResolveError> {
        let client: Arc<dyn LlmClient> = self.0.clone();
        Ok(client)
    }
}

/// A full crew where every role talks to `llm` and browsing is in-memory.
pub fn scripted_crew(llm: &Arc<ScriptedLlm>, stages: SupervisorStages) -> Crew {
    let resolver = ModelResolver::new(None, Arc::new(FixedFactory(llm.clone())));
    let config = Config {
        stages,
        ..Config::default()
    };
    Crew::build(config, &resolver, Arc::new(FakeLauncher::default()))
        .expect("fixed factory always builds")
}

/// Serve a scripted crew on an ephemeral local port. Returns the base URL.
pub async fn serve_crew(llm: &Arc<ScriptedLlm>) -> (String, Arc<AppState>) {
    let state = Arc::new(AppState {
        crew: scripted_crew(llm, SupervisorStages::Full),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    let app = router(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), state)
}

/// Plain text answer.
pub fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: Some(content.to_string()),
        finish_reason: Some("stop".to_string()),
        ..Default::default()
    }
}

/// Answer requesting a single tool call.
pub fn tool_call(name: &str, args: Value) -> ChatResponse {
    ChatResponse {
        tool_calls: Some(vec![ToolCall::new(
            format!("call_{}", name),
            name,
            args.to_string(),
        )]),
        finish_reason: Some("tool_calls".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            tools: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect(),
        });
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("scripted model has no responses left")),
        }
    }
}

/// Page text served by the in-memory browser for URLs containing "long".
pub const LONG_PAGE: &str = "abcdefghijklmnopqrstuvwxyz0123456789abcdefghijklmnopqrstuvwxyz0123456789";

/// In-memory backend serving canned pages.
#[derive(Default)]
pub struct FakeBackend {
    pages: HashMap<String, String>,
    next_id: PageId,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeBackend {
    fn load(&self, url: &str) -> anyhow::Result<PageSnapshot> {
        if url.contains("unreachable") {
            anyhow::bail!("connection refused: {}", url);
        }
        let text = match self.pages.get(url) {
            Some(text) => text.clone(),
            None if url.contains("long") => LONG_PAGE.to_string(),
            None => format!("content of {}", url),
        };
        Ok(PageSnapshot {
            url: url.to_string(),
            title: format!("Title of {}", url),
            text,
            links: Vec::new(),
        })
    }
}

#[async_trait]
impl BrowserBackend for FakeBackend {
    async fn open_page(&mut self, url: &str) -> anyhow::Result<(PageId, PageSnapshot)> {
        let snapshot = self.load(url)?;
        let id = self.next_id;
        self.next_id += 1;
        Ok((id, snapshot))
    }

    async fn goto(&mut self, _page: PageId, url: &str) -> anyhow::Result<PageSnapshot> {
        self.load(url)
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher counting launches and shutdowns of [`FakeBackend`]s.
#[derive(Default)]
pub struct FakeLauncher {
    pages: HashMap<String, String>,
    launches: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    fail: bool,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _options: &BrowserOptions) -> anyhow::Result<Box<dyn BrowserBackend>> {
        if self.fail {
            anyhow::bail!("no browser available");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBackend {
            pages: self.pages.clone(),
            next_id: 0,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}
