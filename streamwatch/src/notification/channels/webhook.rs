//! Webhook sink.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::config::NotificationSettings;
use crate::notification::{DeliveryError, LiveNotification, NotificationSink};
use crate::utils::http_client::build_client;

/// POSTs each notification to its destination, which must be an http(s) URL.
pub struct WebhookSink {
    client: Client,
    token: Option<String>,
}

impl WebhookSink {
    pub fn new(settings: &NotificationSettings) -> crate::Result<Self> {
        Ok(Self {
            client: build_client(settings.timeout)?,
            token: settings.webhook_token.clone(),
        })
    }

    fn destination_url(notification: &LiveNotification) -> Result<Url, DeliveryError> {
        let raw = notification.destination.as_str();
        let url = Url::parse(raw)
            .map_err(|e| DeliveryError::InvalidDestination(format!("{}: {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(DeliveryError::InvalidDestination(format!(
                "unsupported scheme {}",
                scheme
            ))),
        }
    }

    fn build_payload(notification: &LiveNotification) -> serde_json::Value {
        json!({
            "event_type": "stream_live",
            "community_id": notification.community_id,
            "entity_id": notification.entity_id,
            "session_id": notification.session_id,
            "message_template": notification.message_template,
            "timestamp": notification.timestamp.to_rfc3339(),
            "stream": notification.metadata,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn sink_type(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &LiveNotification) -> Result<(), DeliveryError> {
        let url = Self::destination_url(notification)?;
        let payload = Self::build_payload(notification);

        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Webhook delivery rejected");
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(entity = %notification.entity_id, "Webhook notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StreamMetadata;
    use crate::registry::{CommunityId, DestinationSink, EntityId};

    fn notification(destination: &str) -> LiveNotification {
        LiveNotification {
            community_id: CommunityId(42),
            destination: DestinationSink::new(destination),
            entity_id: EntityId::new("alpha"),
            session_id: "s1".into(),
            metadata: StreamMetadata {
                display_name: "Alpha".into(),
                title: "Speedrun".into(),
                url: StreamMetadata::channel_url("alpha"),
                ..Default::default()
            },
            message_template: Some("{streamer} is live!".into()),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_payload() {
        let payload = WebhookSink::build_payload(&notification("https://example.com/hook"));
        assert_eq!(payload["event_type"], "stream_live");
        assert_eq!(payload["community_id"], 42);
        assert_eq!(payload["entity_id"], "alpha");
        assert_eq!(payload["stream"]["display_name"], "Alpha");
        assert_eq!(payload["message_template"], "{streamer} is live!");
    }

    #[tokio::test]
    async fn test_invalid_destination_is_rejected() {
        let sink = WebhookSink::new(&NotificationSettings::default()).unwrap();

        let err = sink.send(&notification("not a url")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidDestination(_)));

        let err = sink
            .send(&notification("ftp://example.com/hook"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidDestination(_)));
    }
}
