//! Client for the HTTP API.

mod aggregator;

pub use aggregator::{
    render, split_artifact_tags, Activity, RenderedMessage, Segment, StreamAggregator, CURSOR,
};

use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};

use crate::api::{ChatRequest, HealthResponse, InvokeResponse, ResetResponse};

pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn agent_url(&self, agent: &str, action: &str) -> String {
        format!("{}/api/agents/{}/{}", self.base_url, urlencoding::encode(agent), action)
    }

    pub async fn health(&self) -> anyhow::Result<HealthResponse> {
        let response = self
            .http
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// One turn without streaming.
    pub async fn invoke(
        &self,
        agent: &str,
        message: &str,
        thread_id: Option<&str>,
    ) -> anyhow::Result<InvokeResponse> {
        let response = self
            .http
            .post(self.agent_url(agent, "invoke"))
            .json(&request(message, thread_id))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} failed with {}: {}", agent, status, body);
        }
        Ok(response.json().await?)
    }

    /// Stream one turn into `aggregator`, calling `on_update` after every
    /// record. Returns once the server sends `done` or closes the stream.
    pub async fn stream(
        &self,
        agent: &str,
        message: &str,
        thread_id: Option<&str>,
        aggregator: &mut StreamAggregator,
        mut on_update: impl FnMut(&StreamAggregator),
    ) -> anyhow::Result<()> {
        let mut source = self
            .http
            .post(self.agent_url(agent, "stream"))
            .json(&request(message, thread_id))
            .eventsource()
            .map_err(|e| anyhow::anyhow!("Failed to open stream: {}", e))?;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    aggregator.push_data(&message.data);
                    on_update(aggregator);
                    if aggregator.is_done() {
                        break;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    source.close();
                    return Err(anyhow::anyhow!("Stream from {} failed: {}", agent, e));
                }
            }
        }
        source.close();
        Ok(())
    }

    /// Forget a conversation on the server. Returns whether it existed.
    pub async fn reset(&self, agent: &str, thread_id: &str) -> anyhow::Result<bool> {
        let url = self.agent_url(agent, &format!("threads/{}", urlencoding::encode(thread_id)));
        let response: ResetResponse = self
            .http
            .delete(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.existed)
    }
}

fn request(message: &str, thread_id: Option<&str>) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        thread_id: thread_id.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{serve_crew, text, tool_call, ScriptedLlm};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stream_into_aggregator() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call("read_file", json!({"path": "missing.csv"})),
            text("Chart: <Render_Image>/nonexistent/chart.png</Render_Image> done"),
        ]));
        let (base, _state) = serve_crew(&llm).await;
        let client = AgentClient::new(format!("{}/", base));

        let mut agg = StreamAggregator::new();
        let mut updates = 0;
        client
            .stream("coder", "draw it", Some("c1"), &mut agg, |_| updates += 1)
            .await
            .unwrap();

        assert!(updates >= 3);
        assert_eq!(agg.thread_id(), Some("c1"));
        assert!(matches!(
            agg.activity(),
            [Activity::ToolStarted { .. }, Activity::ToolFinished { .. }]
        ));
        let rendered = agg.finish();
        assert_eq!(rendered.segments.len(), 3);
        assert_eq!(rendered.warnings, vec!["Image not found: /nonexistent/chart.png"]);
    }

    #[tokio::test]
    async fn test_invoke_and_reset() {
        let llm = Arc::new(ScriptedLlm::new(vec![text("blueprint")]));
        let (base, _state) = serve_crew(&llm).await;
        let client = AgentClient::new(base);

        assert_eq!(client.health().await.unwrap().status, "ok");
        let reply = client.invoke("navigator", "plan", Some("n1")).await.unwrap();
        assert_eq!(reply.content, "blueprint");
        assert!(client.reset("navigator", "n1").await.unwrap());
        assert!(client.invoke("nobody", "x", None).await.is_err());
    }
}
