//! Normalized per-entity status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::EntityId;

/// Thumbnail size substituted into the platform's thumbnail template.
const THUMBNAIL_WIDTH: u32 = 640;
const THUMBNAIL_HEIGHT: u32 = 360;

/// Descriptive data about a live session, passed through to the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub display_name: String,
    pub title: String,
    pub game: Option<String>,
    pub viewer_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    pub url: String,
}

impl StreamMetadata {
    /// Public channel URL for a login.
    pub fn channel_url(login: &str) -> String {
        format!("https://twitch.tv/{}", login)
    }

    /// Fill the `{width}x{height}` placeholders of a thumbnail template.
    pub fn sized_thumbnail(template: &str) -> String {
        template
            .replace("{width}", &THUMBNAIL_WIDTH.to_string())
            .replace("{height}", &THUMBNAIL_HEIGHT.to_string())
    }
}

/// Status of one entity as reported by a successful batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamStatus {
    Live {
        session_id: String,
        metadata: StreamMetadata,
    },
    Offline,
}

impl StreamStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Live { session_id, .. } => Some(session_id),
            Self::Offline => None,
        }
    }
}

/// Statuses for one cycle. Entities of failed batches are absent.
pub type StatusMap = HashMap<EntityId, StreamStatus>;
