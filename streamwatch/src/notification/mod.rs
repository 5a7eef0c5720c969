//! Notification delivery.
//!
//! The monitor hands each computed transition to a [`NotificationSink`]
//! exactly once. Sinks never retry: a failed delivery is reported back as a
//! [`DeliveryError`], logged by the caller, and dropped.
//!
//! # Sinks
//!
//! - [`LogSink`]: records notifications through tracing
//! - [`WebhookSink`]: POSTs a JSON document to the entry's destination URL

pub mod channels;

pub use channels::{LogSink, WebhookSink};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{NotificationSettings, SinkKind};
use crate::monitor::StreamMetadata;
use crate::registry::{CommunityId, DestinationSink, EntityId};

/// A live notification for one community.
#[derive(Debug, Clone, Serialize)]
pub struct LiveNotification {
    pub community_id: CommunityId,
    pub destination: DestinationSink,
    pub entity_id: EntityId,
    pub session_id: String,
    pub metadata: StreamMetadata,
    /// Custom message configured by the community, unrendered.
    pub message_template: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Delivery failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Destination responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Delivery request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("{0}")]
    Other(String),
}

/// Outbound notification interface.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn sink_type(&self) -> &'static str;

    /// Deliver one notification, once.
    async fn send(&self, notification: &LiveNotification) -> Result<(), DeliveryError>;
}

/// Build the configured sink.
pub fn build_sink(settings: &NotificationSettings) -> crate::Result<Arc<dyn NotificationSink>> {
    Ok(match settings.sink {
        SinkKind::Log => Arc::new(LogSink::new()),
        SinkKind::Webhook => Arc::new(WebhookSink::new(settings)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sink() {
        let settings = NotificationSettings::default();
        assert_eq!(build_sink(&settings).unwrap().sink_type(), "log");

        let settings = NotificationSettings {
            sink: SinkKind::Webhook,
            ..Default::default()
        };
        assert_eq!(build_sink(&settings).unwrap().sink_type(), "webhook");
    }
}
