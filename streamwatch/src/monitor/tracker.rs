//! Live-state tracking and transition detection.
//!
//! The tracker remembers, per entity, the last observed live state and
//! session, and per (community, entity) whether the current session has
//! already been announced. [`TransitionTracker::update`] turns one cycle's
//! statuses into the exact set of communities to notify.
//!
//! # State machine
//!
//! - Entity missing from the statuses: unknown this cycle, nothing changes.
//! - Offline: the entity goes offline and every notified flag is cleared.
//! - Live with a session that differs from the recorded one, or after
//!   offline/unknown: a new session starts. Flags are reset and every watching
//!   community is notified.
//! - Live with the recorded session: only communities that have not been
//!   notified for this session yet (they started watching mid-session) are.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::status::{StatusMap, StreamStatus};
use crate::registry::{CommunityId, EntityId, WatchEntry};

/// Last known state of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    #[default]
    Unknown,
    Offline,
    Live,
}

/// A (community, entity) pair that must be notified this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Transition {
    pub community_id: CommunityId,
    pub entity_id: EntityId,
}

#[derive(Debug, Default)]
struct EntityState {
    state: LiveState,
    /// Last observed session, kept while offline.
    session_id: Option<String>,
    last_checked: Option<DateTime<Utc>>,
    /// Communities notified for the current session.
    notified: HashSet<CommunityId>,
}

/// Per-entity live state and per-community notified flags.
///
/// Owned by the monitor loop and mutated only through `&mut self`, so two
/// updates can never interleave.
#[derive(Debug, Default)]
pub struct TransitionTracker {
    entities: HashMap<EntityId, EntityState>,
}

impl TransitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one cycle's statuses against the registry snapshot.
    ///
    /// Returns the pairs to notify, ordered by entity then community.
    pub fn update(&mut self, snapshot: &[WatchEntry], statuses: &StatusMap) -> Vec<Transition> {
        self.update_at(snapshot, statuses, Utc::now())
    }

    fn update_at(
        &mut self,
        snapshot: &[WatchEntry],
        statuses: &StatusMap,
        now: DateTime<Utc>,
    ) -> Vec<Transition> {
        let mut watchers: BTreeMap<&EntityId, Vec<CommunityId>> = BTreeMap::new();
        for entry in snapshot {
            let communities = watchers.entry(&entry.entity_id).or_default();
            if !communities.contains(&entry.community_id) {
                communities.push(entry.community_id);
            }
        }

        // Entities nobody watches any more are forgotten with their flags.
        let before = self.entities.len();
        self.entities.retain(|id, _| watchers.contains_key(id));
        let pruned = before - self.entities.len();
        if pruned > 0 {
            debug!(pruned, "Dropped state of unwatched entities");
        }

        let mut transitions = Vec::new();

        for (entity_id, communities) in watchers {
            // A community that stopped watching loses its flag for this session.
            if let Some(state) = self.entities.get_mut(entity_id) {
                state.notified.retain(|c| communities.contains(c));
            }

            let Some(status) = statuses.get(entity_id) else {
                continue;
            };

            let state = self.entities.entry(entity_id.clone()).or_default();
            state.last_checked = Some(now);

            match status {
                StreamStatus::Offline => {
                    if state.state == LiveState::Live {
                        info!(entity = %entity_id, "Stream went offline");
                    }
                    state.state = LiveState::Offline;
                    state.notified.clear();
                }
                StreamStatus::Live { session_id, .. } => {
                    let new_session = state.state != LiveState::Live
                        || state.session_id.as_deref() != Some(session_id.as_str());

                    if new_session {
                        info!(
                            entity = %entity_id,
                            session = %session_id,
                            "New live session"
                        );
                        state.state = LiveState::Live;
                        state.session_id = Some(session_id.clone());
                        state.notified.clear();
                    }

                    for community_id in communities {
                        if state.notified.insert(community_id) {
                            transitions.push(Transition {
                                community_id,
                                entity_id: entity_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        transitions
    }

    pub fn live_state(&self, entity_id: &EntityId) -> LiveState {
        self.entities
            .get(entity_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Last recorded session of an entity.
    pub fn session_id(&self, entity_id: &EntityId) -> Option<&str> {
        self.entities
            .get(entity_id)
            .and_then(|s| s.session_id.as_deref())
    }

    pub fn last_checked(&self, entity_id: &EntityId) -> Option<DateTime<Utc>> {
        self.entities.get(entity_id).and_then(|s| s.last_checked)
    }

    pub fn is_notified(&self, community_id: CommunityId, entity_id: &EntityId) -> bool {
        self.entities
            .get(entity_id)
            .is_some_and(|s| s.notified.contains(&community_id))
    }

    /// Number of entities with recorded state.
    pub fn tracked_entities(&self) -> usize {
        self.entities.len()
    }
}
