//! Reassembles a streamed agent answer.
//!
//! Events arrive as JSON records, but servers drift: unknown record shapes
//! and bare strings are folded into the text instead of being dropped, and
//! nothing here ever fails.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::stream::StreamEvent;

/// Shown after the text while the answer is still streaming.
pub const CURSOR: &str = "▌";

/// Non-text happenings of a stream, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    ToolStarted { name: String, input: Value },
    ToolFinished { name: String, output: String },
    Error(String),
}

/// One piece of a rendered answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// An artifact that exists on disk.
    Artifact(PathBuf),
    /// An artifact reference whose file is missing.
    Missing(String),
}

/// The final form of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedMessage {
    pub text: String,
    pub segments: Vec<Segment>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
pub struct StreamAggregator {
    buffer: String,
    activity: Vec<Activity>,
    thread_id: Option<String>,
    done: bool,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw SSE `data:` payload.
    pub fn push_data(&mut self, data: &str) {
        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.push_value(value),
            Err(_) => self.push_text(data),
        }
    }

    /// Feed one decoded record.
    pub fn push_value(&mut self, value: Value) {
        match value {
            Value::String(text) => self.push_text(&text),
            Value::Object(ref map) if map.contains_key("type") => {
                match serde_json::from_value::<StreamEvent>(value.clone()) {
                    Ok(event) => self.push_event(event),
                    Err(_) => {
                        tracing::debug!("Unrecognized stream record: {}", value);
                        let text = map
                            .get("content")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| value.to_string());
                        self.push_text(&text);
                    }
                }
            }
            other => self.push_text(&other.to_string()),
        }
    }

    pub fn push_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Token { content } => self.buffer.push_str(&content),
            StreamEvent::ToolStart { name, input } => {
                self.activity.push(Activity::ToolStarted { name, input })
            }
            StreamEvent::ToolEnd { name, output } => {
                self.activity.push(Activity::ToolFinished { name, output })
            }
            StreamEvent::Error { content } => self.activity.push(Activity::Error(content)),
            StreamEvent::Done { thread_id } => {
                self.thread_id = Some(thread_id);
                self.done = true;
            }
        }
    }

    pub fn push_text(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Text so far.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Text so far with the streaming cursor.
    pub fn display(&self) -> String {
        if self.done {
            self.buffer.clone()
        } else {
            format!("{}{}", self.buffer, CURSOR)
        }
    }

    pub fn activity(&self) -> &[Activity] {
        &self.activity
    }

    /// Thread id announced by the final `done` record.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Render the answer, checking artifact paths on disk.
    pub fn finish(self) -> RenderedMessage {
        self.finish_with(|path| path.exists())
    }

    pub fn finish_with(self, exists: impl Fn(&Path) -> bool) -> RenderedMessage {
        let mut rendered = render(&self.buffer, exists);
        let errors = self.activity.into_iter().filter_map(|a| match a {
            Activity::Error(message) => Some(format!("Error: {}", message)),
            _ => None,
        });
        let mut warnings: Vec<String> = errors.collect();
        warnings.append(&mut rendered.warnings);
        if self.buffer.trim().is_empty() {
            warnings.push("The server answered with an empty response.".to_string());
        }
        rendered.warnings = warnings;
        rendered
    }
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<Render_Image>(.*?)</Render_Image>").expect("valid regex"))
}

/// Split `text` on `<Render_Image>PATH</Render_Image>` tags. Even entries
/// are literal text, odd entries the tagged paths.
pub fn split_artifact_tags(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in tag_pattern().captures_iter(text) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        parts.push(&text[last..whole.start()]);
        parts.push(path.as_str());
        last = whole.end();
    }
    parts.push(&text[last..]);
    parts
}

/// Turn tagged text into segments. Whitespace-only text is dropped and
/// missing files become warnings.
pub fn render(text: &str, exists: impl Fn(&Path) -> bool) -> RenderedMessage {
    let mut segments = Vec::new();
    let mut warnings = Vec::new();
    for (i, part) in split_artifact_tags(text).into_iter().enumerate() {
        if i % 2 == 0 {
            if !part.trim().is_empty() {
                segments.push(Segment::Text(part.to_string()));
            }
            continue;
        }
        let path = part.trim();
        if exists(Path::new(path)) {
            segments.push(Segment::Artifact(PathBuf::from(path)));
        } else {
            warnings.push(format!("Image not found: {}", path));
            segments.push(Segment::Missing(path.to_string()));
        }
    }
    RenderedMessage {
        text: text.to_string(),
        segments,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_keeps_surrounding_text() {
        let text = "Chart: <Render_Image>/tmp/chart.png</Render_Image> done";
        assert_eq!(split_artifact_tags(text), vec!["Chart: ", "/tmp/chart.png", " done"]);

        let rendered = render(text, |p| p == Path::new("/tmp/chart.png"));
        assert_eq!(
            rendered.segments,
            vec![
                Segment::Text("Chart: ".into()),
                Segment::Artifact(PathBuf::from("/tmp/chart.png")),
                Segment::Text(" done".into()),
            ]
        );
        assert!(rendered.warnings.is_empty());
    }

    #[test]
    fn test_missing_artifact_is_a_warning() {
        let rendered = render(
            "Chart: <Render_Image>/tmp/chart.png</Render_Image> done",
            |_| false,
        );
        assert_eq!(rendered.segments[1], Segment::Missing("/tmp/chart.png".into()));
        assert_eq!(rendered.warnings, vec!["Image not found: /tmp/chart.png"]);
    }

    #[test]
    fn test_real_file_renders() {
        let dir = tempfile::tempdir().unwrap();
        let chart = dir.path().join("chart.png");
        std::fs::write(&chart, b"png").unwrap();

        let mut agg = StreamAggregator::new();
        agg.push_event(StreamEvent::token(format!(
            "<Render_Image>{}</Render_Image>",
            chart.display()
        )));
        let rendered = agg.finish();
        assert_eq!(rendered.segments, vec![Segment::Artifact(chart)]);
    }

    #[test]
    fn test_mixed_stream_never_fails() {
        let mut agg = StreamAggregator::new();
        agg.push_data(r#"{"type":"tool_start","name":"delegate_navigator","input":{"user_request":"x"}}"#);
        agg.push_data(r#"{"type":"token","content":"Hello"}"#);
        agg.push_data(r#"", world""#);
        agg.push_data("!");
        agg.push_data(r#"{"type":"mystery","content":" more"}"#);
        agg.push_value(json!(42));
        assert_eq!(agg.display(), "Hello, world! more42▌");

        agg.push_data(r#"{"type":"error","content":"coder timed out"}"#);
        agg.push_data(r#"{"type":"done","thread_id":"t-1"}"#);
        assert!(agg.is_done());
        assert_eq!(agg.thread_id(), Some("t-1"));
        assert_eq!(agg.display(), "Hello, world! more42");
        assert!(matches!(agg.activity()[0], Activity::ToolStarted { ref name, .. } if name == "delegate_navigator"));

        let rendered = agg.finish_with(|_| true);
        assert_eq!(rendered.warnings, vec!["Error: coder timed out"]);
    }

    #[test]
    fn test_tool_start_without_input_is_activity() {
        let mut agg = StreamAggregator::new();
        agg.push_data(r#"{"type":"tool_start","name":"browse_web"}"#);
        agg.push_data(r#"{"type":"token","content":"ok"}"#);
        assert_eq!(agg.text(), "ok");
        assert!(matches!(
            agg.activity(),
            [Activity::ToolStarted { name, input }] if name == "browse_web" && input.is_null()
        ));
    }

    #[test]
    fn test_empty_answer_warns() {
        let rendered = StreamAggregator::new().finish_with(|_| true);
        assert!(rendered.segments.is_empty());
        assert_eq!(rendered.warnings.len(), 1);
    }
}
