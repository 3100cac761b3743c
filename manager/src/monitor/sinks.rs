//! Notification sinks
//!
//! Two independent alert channels: an incident-paging events API and a chat
//! webhook. A sink that is not configured is simply never constructed; the
//! monitor logs its absence instead of treating it as an error.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// An alert delivery channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Deliver one alert.
    async fn send(&self, summary: &str, detail: &str) -> Result<()>;
}

/// Incident-paging sink (events API v2).
pub struct PagerSink {
    routing_key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl PagerSink {
    const EVENTS_ENDPOINT: &'static str = "https://events.pagerduty.com/v2/enqueue";

    pub fn new(routing_key: &str) -> Self {
        Self::with_endpoint(routing_key, Self::EVENTS_ENDPOINT)
    }

    pub fn with_endpoint(routing_key: &str, endpoint: &str) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            endpoint: endpoint.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for PagerSink {
    fn name(&self) -> &str {
        "pager"
    }

    async fn send(&self, summary: &str, detail: &str) -> Result<()> {
        let source = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "bridge-manager".to_string());
        let payload = json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "dedup_key": uuid::Uuid::new_v4().to_string(),
            "payload": {
                "summary": summary,
                "source": source,
                "severity": "error",
                "custom_details": detail,
            }
        });
        let response = self.http.post(&self.endpoint).json(&payload).send().await?;
        if response.status().as_u16() != 202 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "paging alert was not accepted");
            return Err(Error::Other(format!("paging alert rejected: {}", status)));
        }
        info!("paging alert triggered");
        Ok(())
    }
}

/// Chat sink posting to an incoming webhook.
pub struct ChatSink {
    webhook_url: String,
    http: reqwest::Client,
}

impl ChatSink {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for ChatSink {
    fn name(&self) -> &str {
        "chat"
    }

    async fn send(&self, summary: &str, detail: &str) -> Result<()> {
        let payload = json!({ "text": format!("*{}*\n{}", summary, detail) });
        self.http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!("chat alert sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pager_sink_posts_the_events_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/enqueue")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"event_action": "trigger", "payload": {"summary": "agents down"}}"#.to_string(),
            ))
            .with_status(202)
            .create_async()
            .await;

        let sink = PagerSink::with_endpoint("rk-123", &format!("{}/v2/enqueue", server.url()));
        sink.send("agents down", "agent1 DISCONNECTED").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn pager_sink_surfaces_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/enqueue")
            .with_status(400)
            .create_async()
            .await;

        let sink = PagerSink::with_endpoint("rk-123", &format!("{}/v2/enqueue", server.url()));
        assert!(sink.send("t", "d").await.is_err());
    }

    #[tokio::test]
    async fn chat_sink_posts_to_the_webhook() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .create_async()
            .await;

        let sink = ChatSink::new(&format!("{}/hook", server.url()));
        sink.send("agents down", "detail").await.unwrap();
        mock.assert_async().await;
    }
}
