//! Monitor events.
//!
//! Events are published on a broadcast channel for observers such as an
//! alerting hook or a status page. Publishing never blocks the monitor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::service::CycleOutcome;
use crate::registry::{CommunityId, EntityId};

/// Events emitted by the monitor loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A community was notified of a new live session.
    StreamerLive {
        community_id: CommunityId,
        entity_id: EntityId,
        session_id: String,
        /// Whether the sink accepted the notification.
        delivered: bool,
        timestamp: DateTime<Utc>,
    },
    /// An entity that was live is now offline.
    StreamerOffline {
        entity_id: EntityId,
        session_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A cycle finished (or was skipped).
    CycleCompleted(CycleOutcome),
    /// Access tokens could not be obtained for several cycles in a row.
    CredentialAlert {
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn description(&self) -> String {
        match self {
            Self::StreamerLive {
                community_id,
                entity_id,
                delivered,
                ..
            } => {
                if *delivered {
                    format!("{} is live, notified community {}", entity_id, community_id)
                } else {
                    format!(
                        "{} is live, delivery to community {} failed",
                        entity_id, community_id
                    )
                }
            }
            Self::StreamerOffline { entity_id, .. } => format!("{} went offline", entity_id),
            Self::CycleCompleted(outcome) => format!("cycle {:?}", outcome.status),
            Self::CredentialAlert {
                consecutive_failures,
                ..
            } => format!(
                "no access token for {} consecutive cycles",
                consecutive_failures
            ),
        }
    }

    /// Whether this event needs an operator's attention.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::CredentialAlert { .. })
    }
}

/// Broadcaster for monitor events.
#[derive(Clone)]
pub struct MonitorEventBroadcaster {
    sender: broadcast::Sender<MonitorEvent>,
}

impl MonitorEventBroadcaster {
    /// Create a new broadcaster with default capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers; zero when nobody
    /// is listening.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MonitorEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
