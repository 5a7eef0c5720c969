//! External status API.
//!
//! [`StatusApi`] is one batch request against the platform. Batching limits,
//! retries and backoff are applied by [`super::StatusClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::status::{StreamMetadata, StreamStatus};
use crate::config::TwitchConfig;
use crate::credentials::{CredentialError, CredentialManager};
use crate::registry::EntityId;

/// Errors from a single batch request.
#[derive(Debug, Error)]
pub enum StatusApiError {
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The API rejected the access token.
    #[error("Access token rejected")]
    Unauthorized,

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Unexpected status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl StatusApiError {
    /// Whether another attempt of the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unauthorized | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Credential(e) => e.is_transient(),
            Self::Decode(_) => false,
        }
    }

    /// Delay requested by the server, if any.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One entry of the Helix `streams` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(rename = "type", default)]
    pub stream_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thumbnail_url: String,
}

impl StreamRecord {
    /// A minimal live record.
    pub fn live(login: &str, session_id: &str) -> Self {
        Self {
            id: session_id.to_string(),
            user_login: login.to_string(),
            user_name: login.to_string(),
            stream_type: "live".to_string(),
            ..Default::default()
        }
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(&self.user_login)
    }

    /// Normalize into a status. Anything other than a live record with a
    /// stream id counts as offline.
    pub fn into_status(self) -> StreamStatus {
        if self.stream_type != "live" || self.id.is_empty() {
            return StreamStatus::Offline;
        }

        let login = self.user_login.trim().to_ascii_lowercase();
        let metadata = StreamMetadata {
            display_name: if self.user_name.is_empty() {
                login.clone()
            } else {
                self.user_name
            },
            title: self.title,
            game: (!self.game_name.is_empty()).then_some(self.game_name),
            viewer_count: self.viewer_count,
            started_at: self.started_at,
            thumbnail_url: (!self.thumbnail_url.is_empty())
                .then(|| StreamMetadata::sized_thumbnail(&self.thumbnail_url)),
            url: StreamMetadata::channel_url(&login),
        };

        StreamStatus::Live {
            session_id: self.id,
            metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HelixResponse {
    #[serde(default)]
    data: Vec<StreamRecord>,
}

/// A single batch query against the status API.
#[async_trait]
pub trait StatusApi: Send + Sync {
    /// Query the given entities in one request. Entities that are not live
    /// are simply absent from the result.
    async fn fetch_batch(&self, ids: &[EntityId]) -> Result<Vec<StreamRecord>, StatusApiError>;
}

/// Twitch Helix `GET /streams`.
pub struct HelixStatusApi {
    client: Client,
    credentials: Arc<CredentialManager>,
    client_id: String,
    helix_url: String,
}

impl HelixStatusApi {
    pub fn new(client: Client, credentials: Arc<CredentialManager>, config: &TwitchConfig) -> Self {
        Self {
            client,
            credentials,
            client_id: config.client_id.clone(),
            helix_url: config.helix_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusApi for HelixStatusApi {
    async fn fetch_batch(&self, ids: &[EntityId]) -> Result<Vec<StreamRecord>, StatusApiError> {
        let token = self.credentials.get_token().await?;

        let first = ids.len().to_string();
        let mut query: Vec<(&str, &str)> =
            ids.iter().map(|id| ("user_login", id.as_str())).collect();
        query.push(("first", first.as_str()));

        let response = self
            .client
            .get(format!("{}/streams", self.helix_url))
            .header("Client-Id", &self.client_id)
            .bearer_auth(token.secret())
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                let body: HelixResponse = response
                    .json()
                    .await
                    .map_err(|e| StatusApiError::Decode(e.to_string()))?;
                debug!(requested = ids.len(), live = body.data.len(), "Fetched stream batch");
                Ok(body.data)
            }
            StatusCode::UNAUTHORIZED => {
                warn!("Status API rejected the access token");
                self.credentials.invalidate(&token);
                Err(StatusApiError::Unauthorized)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = parse_retry_after(response.headers(), Utc::now().timestamp());
                Err(StatusApiError::RateLimited { retry_after })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(StatusApiError::Http {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Parse a rate-limit reset hint.
///
/// `Retry-After` carries seconds to wait; `Ratelimit-Reset` carries the unix
/// time at which the bucket refills.
pub fn parse_retry_after(headers: &HeaderMap, now_unix: i64) -> Option<Duration> {
    if let Some(value) = headers.get("Retry-After")
        && let Ok(secs) = value.to_str().unwrap_or_default().trim().parse::<f64>()
        && secs >= 0.0
    {
        // Out-of-range values (huge, NaN, inf) fall through to the reset header.
        if let Ok(wait) = Duration::try_from_secs_f64(secs) {
            return Some(wait);
        }
    }

    if let Some(value) = headers.get("Ratelimit-Reset")
        && let Ok(reset) = value.to_str().unwrap_or_default().trim().parse::<i64>()
    {
        let wait = reset.saturating_sub(now_unix).max(0);
        return Some(Duration::from_secs(wait.unsigned_abs()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_helix_response() {
        let json = r#"{
            "data": [{
                "id": "40952121085",
                "user_id": "101051819",
                "user_login": "Alpha",
                "user_name": "Alpha",
                "game_id": "32982",
                "game_name": "Grand Theft Auto V",
                "type": "live",
                "title": "Heist night",
                "viewer_count": 7890,
                "started_at": "2021-03-10T03:18:11Z",
                "language": "en",
                "thumbnail_url": "https://static-cdn.jtvnw.net/previews-ttv/live_user_alpha-{width}x{height}.jpg",
                "is_mature": false
            }],
            "pagination": {}
        }"#;

        let response: HelixResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.data.len(), 1);

        let record = response.data[0].clone();
        assert_eq!(record.entity_id().as_str(), "alpha");

        match record.into_status() {
            StreamStatus::Live {
                session_id,
                metadata,
            } => {
                assert_eq!(session_id, "40952121085");
                assert_eq!(metadata.display_name, "Alpha");
                assert_eq!(metadata.game.as_deref(), Some("Grand Theft Auto V"));
                assert_eq!(metadata.viewer_count, 7890);
                assert_eq!(metadata.url, "https://twitch.tv/alpha");
                assert!(metadata.thumbnail_url.unwrap().ends_with("-640x360.jpg"));
                assert!(metadata.started_at.is_some());
            }
            StreamStatus::Offline => panic!("expected live"),
        }
    }

    #[test]
    fn test_non_live_record_is_offline() {
        let mut record = StreamRecord::live("alpha", "s1");
        record.stream_type = String::new();
        assert_eq!(record.into_status(), StreamStatus::Offline);

        let record = StreamRecord::live("alpha", "");
        assert_eq!(record.into_status(), StreamStatus::Offline);
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, 1000), None);

        headers.insert("Ratelimit-Reset", HeaderValue::from_static("1005"));
        assert_eq!(
            parse_retry_after(&headers, 1000),
            Some(Duration::from_secs(5))
        );
        // Reset already passed.
        assert_eq!(
            parse_retry_after(&headers, 2000),
            Some(Duration::from_secs(0))
        );

        headers.insert("Retry-After", HeaderValue::from_static("2.5"));
        assert_eq!(
            parse_retry_after(&headers, 1000),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_parse_retry_after_out_of_range() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_static("1e30"));
        assert_eq!(parse_retry_after(&headers, 1000), None);

        headers.insert("Retry-After", HeaderValue::from_static("inf"));
        assert_eq!(parse_retry_after(&headers, 1000), None);

        // Falls back to the reset header when Retry-After is unusable.
        headers.insert("Ratelimit-Reset", HeaderValue::from_static("1003"));
        assert_eq!(
            parse_retry_after(&headers, 1000),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StatusApiError::RateLimited { retry_after: None }.is_retryable());
        assert!(StatusApiError::Unauthorized.is_retryable());
        assert!(
            StatusApiError::Http {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !StatusApiError::Http {
                status: 400,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!StatusApiError::Decode("bad".into()).is_retryable());
        assert!(!StatusApiError::Credential(CredentialError::MissingCredentials).is_retryable());
        assert!(StatusApiError::Credential(CredentialError::Network("reset".into())).is_retryable());
    }

    #[test]
    fn test_retry_hint() {
        let err = StatusApiError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_hint(), Some(Duration::from_secs(3)));
        assert_eq!(StatusApiError::Unauthorized.retry_hint(), None);
    }
}
