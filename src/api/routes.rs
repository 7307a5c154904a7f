//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::AgentRole;
use crate::browser::BrowserState;
use crate::config::{Config, SupervisorStages};
use crate::crew::{default_launcher, Crew};
use crate::llm::{EnvModelFactory, ModelResolver};
use crate::stream::{EventSink, StreamEvent};
use crate::threads::ThreadId;

use super::types::*;

/// Events buffered per stream before the agent turn waits for the client.
const STREAM_BUFFER: usize = 256;

/// Shared application state.
pub struct AppState {
    pub crew: Crew,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/agents/:agent/stream", post(stream_agent))
        .route("/api/agents/:agent/invoke", post(invoke_agent))
        .route("/api/agents/:agent/threads/:thread_id", delete(reset_thread))
        .route("/api/browser", get(browser_state).delete(close_browser))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let resolver = ModelResolver::new(
        config.llm_model.clone(),
        Arc::new(EnvModelFactory::from_env()),
    );
    let addr = config.bind_addr();
    let crew = Crew::build(config, &resolver, default_launcher())?;
    let state = Arc::new(AppState { crew });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.crew.shutdown().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn parse_agent(agent: &str) -> Result<AgentRole, (StatusCode, String)> {
    AgentRole::parse(agent).ok_or_else(|| {
        let known = AgentRole::ALL.map(|r| r.as_str()).join(", ");
        (
            StatusCode::NOT_FOUND,
            format!("Unknown agent '{}'. Expected one of: {}", agent, known),
        )
    })
}

fn thread_or_new(thread_id: Option<String>) -> ThreadId {
    thread_id
        .filter(|t| !t.trim().is_empty())
        .map(ThreadId::new)
        .unwrap_or_else(ThreadId::generate)
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stages = match state.crew.config().stages {
        SupervisorStages::Full => "full",
        SupervisorStages::Collect => "collect",
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: AgentRole::ALL.iter().map(|r| r.as_str().to_string()).collect(),
        stages: stages.to_string(),
    })
}

/// Run one turn and stream its events. The stream always ends with `done`,
/// preceded by `error` when the turn failed.
async fn stream_agent(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let role = parse_agent(&agent)?;
    let thread_id = thread_or_new(req.thread_id);
    let (sink, mut rx) = EventSink::channel(STREAM_BUFFER);

    tracing::info!(agent = %role, thread = %thread_id, "Stream request");

    // The turn runs to completion even if the client goes away.
    tokio::spawn(async move {
        let result = state
            .crew
            .chat(role, &thread_id, &req.message, Some(sink.clone()))
            .await;
        if let Err(e) = result {
            tracing::warn!(agent = %role, thread = %thread_id, "Turn failed: {}", e);
            sink.emit(StreamEvent::error(e.to_string())).await;
        }
        sink.emit(StreamEvent::Done {
            thread_id: thread_id.to_string(),
        })
        .await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match Event::default().json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => tracing::warn!("Failed to encode stream event: {}", e),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Run one turn and return the final answer.
async fn invoke_agent(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<InvokeResponse>, (StatusCode, String)> {
    let role = parse_agent(&agent)?;
    let thread_id = thread_or_new(req.thread_id);

    let content = state
        .crew
        .chat(role, &thread_id, &req.message, None)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(InvokeResponse {
        agent: role.to_string(),
        thread_id: thread_id.to_string(),
        content,
    }))
}

async fn reset_thread(
    State(state): State<Arc<AppState>>,
    Path((agent, thread_id)): Path<(String, String)>,
) -> Result<Json<ResetResponse>, (StatusCode, String)> {
    let role = parse_agent(&agent)?;
    let id = ThreadId::new(thread_id);
    let existed = state.crew.reset(role, &id).await;
    tracing::info!(agent = %role, thread = %id, existed, "Thread reset");
    Ok(Json(ResetResponse {
        agent: role.to_string(),
        thread_id: id.to_string(),
        existed,
    }))
}

async fn browser_state(State(state): State<Arc<AppState>>) -> Json<BrowserState> {
    Json(state.crew.browser().state().await)
}

/// Explicit teardown of the shared browser session.
async fn close_browser(State(state): State<Arc<AppState>>) -> Json<BrowserTeardownResponse> {
    let holder = state.crew.browser().teardown().await;
    if let Some(holder) = &holder {
        tracing::info!(holder = %holder, "Shared browser closed on request");
    }
    Json(BrowserTeardownResponse {
        closed: holder.is_some(),
        holder,
    })
}
