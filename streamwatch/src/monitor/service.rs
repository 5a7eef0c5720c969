//! Monitor loop.
//!
//! One cycle: snapshot the registry, query every watched entity, feed the
//! statuses to the tracker, and hand each resulting transition to the sink
//! once. Cycles run one after another inside [`MonitorLoop::run`]; the
//! tracker is owned by the loop and only touched between awaits of the same
//! task, so two cycles can never update it concurrently.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::events::{MonitorEvent, MonitorEventBroadcaster};
use super::status::{StatusMap, StreamStatus};
use super::status_client::{StatusClient, StatusReport};
use super::tracker::{LiveState, Transition, TransitionTracker};
use crate::config::MonitorConfig;
use crate::notification::{LiveNotification, NotificationSink};
use crate::registry::{EntityId, WatchEntry, WatchRegistry, entity_set};

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleStatus {
    /// Nothing is watched.
    Idle,
    /// Every batch succeeded.
    Completed,
    /// Some batches failed; their entities are unknown this cycle.
    Partial,
    /// No state was touched.
    Skipped { reason: String },
}

/// Summary of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    /// Registry entries in the snapshot.
    pub entries: usize,
    /// Distinct entities queried.
    pub entities: usize,
    /// Entities reported live.
    pub live: usize,
    /// Transitions computed.
    pub notified: usize,
    pub delivery_failures: usize,
    pub failed_batches: usize,
    pub credential_failure: bool,
    pub duration_ms: u64,
}

impl CycleOutcome {
    fn new(status: CycleStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            status,
            started_at,
            entries: 0,
            entities: 0,
            live: 0,
            notified: 0,
            delivery_failures: 0,
            failed_batches: 0,
            credential_failure: false,
            duration_ms: 0,
        }
    }
}

/// Periodic monitoring driver.
pub struct MonitorLoop {
    registry: Arc<dyn WatchRegistry>,
    client: StatusClient,
    sink: Arc<dyn NotificationSink>,
    config: MonitorConfig,
    tracker: TransitionTracker,
    events: MonitorEventBroadcaster,
    /// Consecutive polled cycles with a credential failure.
    credential_failures: u32,
    alerted: bool,
}

impl MonitorLoop {
    pub fn new(
        registry: Arc<dyn WatchRegistry>,
        client: StatusClient,
        sink: Arc<dyn NotificationSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            client,
            sink,
            config,
            tracker: TransitionTracker::new(),
            events: MonitorEventBroadcaster::new(),
            credential_failures: 0,
            alerted: false,
        }
    }

    /// Run cycles every `poll_interval` until `cancel` fires.
    ///
    /// The first cycle starts immediately. A cycle that outlasts the interval
    /// delays the next one instead of overlapping it.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.poll_interval, "Monitor loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.run_cycle_with(&cancel).await;

            if cancel.is_cancelled() {
                break;
            }
        }

        info!("Monitor loop stopped");
    }

    /// Run a single cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.run_cycle_with(&CancellationToken::new()).await
    }

    /// Run a single cycle, giving outstanding queries `shutdown_grace` once
    /// `cancel` fires.
    #[instrument(name = "cycle", skip_all)]
    pub async fn run_cycle_with(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let started = Instant::now();
        let started_at = Utc::now();

        let snapshot = match self.registry.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Registry unreadable, skipping cycle");
                let outcome = CycleOutcome::new(
                    CycleStatus::Skipped {
                        reason: format!("registry unreadable: {}", e),
                    },
                    started_at,
                );
                return self.finish(outcome, started);
            }
        };

        if snapshot.is_empty() {
            debug!("Nothing watched, idle cycle");
            return self.finish(CycleOutcome::new(CycleStatus::Idle, started_at), started);
        }

        let entities = entity_set(&snapshot);

        let report = {
            let poll = self.client.get_statuses(&entities);
            tokio::pin!(poll);

            tokio::select! {
                biased;
                report = &mut poll => Some(report),
                _ = cancel.cancelled() => {
                    info!(grace = ?self.config.shutdown_grace, "Shutdown requested, waiting for status queries");
                    tokio::time::timeout(self.config.shutdown_grace, &mut poll).await.ok()
                }
            }
        };

        let Some(report) = report else {
            warn!("Status queries did not finish within the grace period, abandoning cycle");
            let mut outcome = CycleOutcome::new(
                CycleStatus::Skipped {
                    reason: "shutdown".to_string(),
                },
                started_at,
            );
            outcome.entries = snapshot.len();
            outcome.entities = entities.len();
            return self.finish(outcome, started);
        };

        let status = if report.is_complete() {
            CycleStatus::Completed
        } else {
            CycleStatus::Partial
        };
        let mut outcome = CycleOutcome::new(status, started_at);
        outcome.entries = snapshot.len();
        outcome.entities = entities.len();
        outcome.live = report.statuses.values().filter(|s| s.is_live()).count();
        outcome.failed_batches = report.failures.len();
        outcome.credential_failure = report.credential_failure();

        self.apply(&snapshot, &report, &mut outcome).await;

        self.finish(outcome, started)
    }

    /// Update the tracker and deliver the resulting notifications.
    async fn apply(
        &mut self,
        snapshot: &[WatchEntry],
        report: &StatusReport,
        outcome: &mut CycleOutcome,
    ) {
        let went_offline = self.going_offline(&report.statuses);
        let transitions = self.tracker.update(snapshot, &report.statuses);
        outcome.notified = transitions.len();

        let now = Utc::now();
        for (entity_id, session_id) in went_offline {
            self.events.publish(MonitorEvent::StreamerOffline {
                entity_id,
                session_id,
                timestamp: now,
            });
        }

        let notifications: Vec<LiveNotification> = transitions
            .iter()
            .filter_map(|t| build_notification(t, snapshot, &report.statuses, now))
            .collect();

        let sink = Arc::clone(&self.sink);
        let results = join_all(notifications.iter().map(|n| sink.send(n))).await;

        for (notification, result) in notifications.iter().zip(results) {
            let delivered = match result {
                Ok(()) => {
                    info!(
                        community = %notification.community_id,
                        entity = %notification.entity_id,
                        session = %notification.session_id,
                        "Sent live notification"
                    );
                    true
                }
                Err(e) => {
                    // The flag stays set; the transition is not delivered again.
                    warn!(
                        community = %notification.community_id,
                        entity = %notification.entity_id,
                        error = %e,
                        "Failed to deliver live notification"
                    );
                    outcome.delivery_failures += 1;
                    false
                }
            };

            self.events.publish(MonitorEvent::StreamerLive {
                community_id: notification.community_id,
                entity_id: notification.entity_id.clone(),
                session_id: notification.session_id.clone(),
                delivered,
                timestamp: notification.timestamp,
            });
        }
    }

    /// Entities currently live that this cycle reports offline.
    fn going_offline(&self, statuses: &StatusMap) -> Vec<(EntityId, Option<String>)> {
        statuses
            .iter()
            .filter(|(id, status)| {
                !status.is_live() && self.tracker.live_state(id) == LiveState::Live
            })
            .map(|(id, _)| (id.clone(), self.tracker.session_id(id).map(str::to_string)))
            .collect()
    }

    fn finish(&mut self, mut outcome: CycleOutcome, started: Instant) -> CycleOutcome {
        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if matches!(outcome.status, CycleStatus::Completed | CycleStatus::Partial) {
            self.track_credentials(outcome.credential_failure);
        }

        match &outcome.status {
            CycleStatus::Idle => debug!(duration_ms = outcome.duration_ms, "Cycle idle"),
            CycleStatus::Skipped { reason } => {
                warn!(reason = %reason, duration_ms = outcome.duration_ms, "Cycle skipped")
            }
            CycleStatus::Completed | CycleStatus::Partial => info!(
                entities = outcome.entities,
                live = outcome.live,
                notified = outcome.notified,
                delivery_failures = outcome.delivery_failures,
                failed_batches = outcome.failed_batches,
                duration_ms = outcome.duration_ms,
                "Cycle finished"
            ),
        }

        self.events
            .publish(MonitorEvent::CycleCompleted(outcome.clone()));
        outcome
    }

    fn track_credentials(&mut self, failed: bool) {
        if !failed {
            if self.credential_failures > 0 {
                info!(
                    after = self.credential_failures,
                    "Access token available again"
                );
            }
            self.credential_failures = 0;
            self.alerted = false;
            return;
        }

        self.credential_failures += 1;
        if self.credential_failures >= self.config.credential_alert_threshold && !self.alerted {
            error!(
                consecutive_failures = self.credential_failures,
                "No access token for several consecutive cycles, check the client credentials"
            );
            self.events.publish(MonitorEvent::CredentialAlert {
                consecutive_failures: self.credential_failures,
                timestamp: Utc::now(),
            });
            self.alerted = true;
        }
    }

    pub fn tracker(&self) -> &TransitionTracker {
        &self.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &MonitorEventBroadcaster {
        &self.events
    }

    pub fn consecutive_credential_failures(&self) -> u32 {
        self.credential_failures
    }
}

/// Resolve destination and template for a transition from the same snapshot
/// the transition was computed from.
fn build_notification(
    transition: &Transition,
    snapshot: &[WatchEntry],
    statuses: &StatusMap,
    timestamp: DateTime<Utc>,
) -> Option<LiveNotification> {
    let entry = snapshot.iter().find(|e| {
        e.community_id == transition.community_id && e.entity_id == transition.entity_id
    })?;

    let StreamStatus::Live {
        session_id,
        metadata,
    } = statuses.get(&transition.entity_id)?
    else {
        return None;
    };

    Some(LiveNotification {
        community_id: entry.community_id,
        destination: entry.destination.clone(),
        entity_id: entry.entity_id.clone(),
        session_id: session_id.clone(),
        metadata: metadata.clone(),
        message_template: entry.message_template.clone(),
        timestamp,
    })
}
