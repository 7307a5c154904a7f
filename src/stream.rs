//! Incremental events emitted while an agent turn runs.
//!
//! Serialized as `{"type": "...", ...}` records, one per SSE `data:` line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of the final answer text.
    Token { content: String },
    /// A tool (or delegation) is about to run.
    ToolStart {
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// A tool (or delegation) finished.
    ToolEnd { name: String, output: String },
    /// A recoverable failure worth showing to the user.
    Error { content: String },
    /// End of stream.
    Done { thread_id: String },
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }
}

/// Sending half of an event stream. Emitting never fails: once the
/// consumer hangs up, events are dropped and the turn keeps running.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

/// Emit to an optional sink.
pub async fn emit(sink: Option<&EventSink>, event: StreamEvent) {
    if let Some(sink) = sink {
        sink.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            serde_json::to_value(StreamEvent::token("hi")).unwrap(),
            json!({"type": "token", "content": "hi"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::ToolStart {
                name: "delegate_navigator".into(),
                input: json!({"user_request": "x"}),
            })
            .unwrap(),
            json!({"type": "tool_start", "name": "delegate_navigator", "input": {"user_request": "x"}})
        );
        let parsed: StreamEvent =
            serde_json::from_value(json!({"type": "error", "content": "boom"})).unwrap();
        assert_eq!(parsed, StreamEvent::error("boom"));
    }

    #[test]
    fn test_tool_start_without_input() {
        let parsed: StreamEvent =
            serde_json::from_value(json!({"type": "tool_start", "name": "browse_web"})).unwrap();
        assert_eq!(
            parsed,
            StreamEvent::ToolStart {
                name: "browse_web".into(),
                input: Value::Null,
            }
        );
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        sink.emit(StreamEvent::token("lost")).await;
        emit(None, StreamEvent::token("nowhere")).await;
    }
}
