#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use streamwatch::config::MonitorConfig;
use streamwatch::monitor::{
    MonitorLoop, StatusApi, StatusApiError, StatusClient, StatusClientConfig, StreamRecord,
};
use streamwatch::notification::{DeliveryError, LiveNotification, NotificationSink};
use streamwatch::registry::{EntityId, WatchRegistry};

/// Status API whose answers are set by the test.
#[derive(Default)]
pub struct ScriptedApi {
    live: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn set_live(&self, login: &str, session: &str) {
        self.live.lock().insert(login.into(), session.into());
    }

    pub fn set_offline(&self, login: &str) {
        self.live.lock().remove(login);
    }

    /// Every batch containing `login` fails with a server error.
    pub fn fail_batches_with(&self, login: &str) {
        self.failing.lock().insert(login.into());
    }

    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusApi for ScriptedApi {
    async fn fetch_batch(&self, ids: &[EntityId]) -> Result<Vec<StreamRecord>, StatusApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing.lock();
        if ids.iter().any(|id| failing.contains(id.as_str())) {
            return Err(StatusApiError::Http {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        drop(failing);

        let live = self.live.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                live.get(id.as_str())
                    .map(|session| StreamRecord::live(id.as_str(), session))
            })
            .collect())
    }
}

/// Sink that records every delivery.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<LiveNotification>>,
}

impl RecordingSink {
    /// Drain the (community, entity) pairs delivered so far, sorted.
    pub fn take_pairs(&self) -> Vec<(u64, String)> {
        let mut pairs: Vec<_> = self
            .sent
            .lock()
            .drain(..)
            .map(|n| (n.community_id.0, n.entity_id.to_string()))
            .collect();
        pairs.sort();
        pairs
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn sink_type(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, notification: &LiveNotification) -> Result<(), DeliveryError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

pub fn test_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(20),
        batch_size: 2,
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn monitor(
    registry: Arc<dyn WatchRegistry>,
    api: Arc<ScriptedApi>,
    sink: Arc<RecordingSink>,
) -> MonitorLoop {
    let config = test_config();
    let client = StatusClient::new(api, StatusClientConfig::from(&config));
    MonitorLoop::new(registry, client, sink, config)
}
