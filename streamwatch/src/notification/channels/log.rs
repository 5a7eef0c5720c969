//! Log-only sink.

use async_trait::async_trait;
use tracing::info;

use crate::notification::{DeliveryError, LiveNotification, NotificationSink};

/// Writes each notification to the log. Never fails.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    fn sink_type(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &LiveNotification) -> Result<(), DeliveryError> {
        info!(
            community = %notification.community_id,
            destination = %notification.destination,
            entity = %notification.entity_id,
            session = %notification.session_id,
            title = %notification.metadata.title,
            url = %notification.metadata.url,
            "{} is live",
            notification.metadata.display_name
        );
        Ok(())
    }
}
