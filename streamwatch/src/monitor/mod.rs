//! Live-state monitoring.
//!
//! # Architecture
//!
//! - [`StatusApi`]: one batch request against the platform's status endpoint
//! - [`StatusClient`]: batching, rate limiting and retry on top of the API
//! - [`TransitionTracker`]: per-entity live state and per-community notified flags
//! - [`MonitorLoop`]: the periodic driver tying registry, client, tracker and sink together

mod api;
mod events;
mod rate_limiter;
mod service;
mod status;
mod status_client;
mod tracker;

pub use api::{HelixStatusApi, StatusApi, StatusApiError, StreamRecord, parse_retry_after};
pub use events::{MonitorEvent, MonitorEventBroadcaster};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use service::{CycleOutcome, CycleStatus, MonitorLoop};
pub use status::{StatusMap, StreamMetadata, StreamStatus};
pub use status_client::{
    BatchQueryError, StatusClient, StatusClientConfig, StatusReport, backoff_delay,
};
pub use tracker::{LiveState, Transition, TransitionTracker};
