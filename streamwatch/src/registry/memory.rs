//! In-memory watch registry.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    CommunityId, DestinationSink, EntityId, RegistryLimits, RegistryStats, WatchEntry,
    WatchRegistry, WatchStore,
};
use crate::{Error, Result};

/// Everything the registry stores for one community.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunitySettings {
    /// Watched entities in the order they were added.
    pub entities: Vec<EntityId>,
    pub destination: Option<DestinationSink>,
    #[serde(default)]
    pub message_templates: BTreeMap<EntityId, String>,
}

/// Registry held entirely in process memory.
///
/// Every operation takes the lock once, so a snapshot sees each community
/// either before or after a concurrent mutation, never in between.
pub struct InMemoryWatchRegistry {
    communities: RwLock<BTreeMap<CommunityId, CommunitySettings>>,
    limits: RegistryLimits,
}

impl InMemoryWatchRegistry {
    pub fn new() -> Self {
        Self::with_limits(RegistryLimits::default())
    }

    pub fn with_limits(limits: RegistryLimits) -> Self {
        Self {
            communities: RwLock::new(BTreeMap::new()),
            limits,
        }
    }

    /// Serialize all communities as JSON, for backups.
    pub fn export_json(&self) -> Result<String> {
        let communities = self.communities.read();
        Ok(serde_json::to_string_pretty(&*communities)?)
    }

    /// Replace all communities with the contents of a JSON export.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let imported: BTreeMap<CommunityId, CommunitySettings> = serde_json::from_str(json)?;
        info!(communities = imported.len(), "Imported watch registry");
        *self.communities.write() = imported;
        Ok(())
    }

    /// Replace all communities with the JSON export stored at `path`.
    pub fn import_file(&self, path: &Path) -> Result<()> {
        let json = std::fs::read_to_string(path)?;
        self.import_json(&json)
    }

    pub fn is_empty(&self) -> bool {
        self.communities.read().is_empty()
    }
}

impl Default for InMemoryWatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WatchRegistry for InMemoryWatchRegistry {
    async fn snapshot(&self) -> Result<Vec<WatchEntry>> {
        let communities = self.communities.read();

        let entries = communities
            .iter()
            .filter_map(|(id, settings)| {
                settings
                    .destination
                    .as_ref()
                    .map(|destination| (id, settings, destination))
            })
            .flat_map(|(id, settings, destination)| {
                settings.entities.iter().map(move |entity| WatchEntry {
                    community_id: *id,
                    entity_id: entity.clone(),
                    destination: destination.clone(),
                    message_template: settings.message_templates.get(entity).cloned(),
                })
            })
            .collect();

        Ok(entries)
    }
}

#[async_trait]
impl WatchStore for InMemoryWatchRegistry {
    async fn create_community(&self, community_id: CommunityId) -> Result<bool> {
        let mut communities = self.communities.write();
        if communities.contains_key(&community_id) {
            return Ok(false);
        }
        communities.insert(community_id, CommunitySettings::default());
        info!(community = %community_id, "Created community");
        Ok(true)
    }

    async fn delete_community(&self, community_id: CommunityId) -> Result<bool> {
        let removed = self.communities.write().remove(&community_id).is_some();
        if removed {
            info!(community = %community_id, "Deleted community");
        }
        Ok(removed)
    }

    async fn add_entity(&self, community_id: CommunityId, entity_id: &EntityId) -> Result<bool> {
        let mut communities = self.communities.write();
        let settings = communities.entry(community_id).or_default();

        if settings.entities.contains(entity_id) {
            return Ok(false);
        }
        self.limits
            .check_capacity(community_id, settings.entities.len())?;

        settings.entities.push(entity_id.clone());
        info!(community = %community_id, entity = %entity_id, "Added watched channel");
        Ok(true)
    }

    async fn remove_entity(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
    ) -> Result<bool> {
        let mut communities = self.communities.write();
        let Some(settings) = communities.get_mut(&community_id) else {
            return Ok(false);
        };

        let before = settings.entities.len();
        settings.entities.retain(|e| e != entity_id);
        settings.message_templates.remove(entity_id);

        let removed = settings.entities.len() != before;
        if removed {
            info!(community = %community_id, entity = %entity_id, "Removed watched channel");
        }
        Ok(removed)
    }

    async fn set_destination(
        &self,
        community_id: CommunityId,
        destination: DestinationSink,
    ) -> Result<()> {
        let mut communities = self.communities.write();
        communities.entry(community_id).or_default().destination = Some(destination);
        info!(community = %community_id, "Set notification destination");
        Ok(())
    }

    async fn set_message_template(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
        template: Option<String>,
    ) -> Result<()> {
        if let Some(template) = &template {
            self.limits.check_template(template)?;
        }

        let mut communities = self.communities.write();
        let settings = communities
            .get_mut(&community_id)
            .filter(|s| s.entities.contains(entity_id))
            .ok_or_else(|| {
                Error::not_found("Watch", format!("{}/{}", community_id, entity_id))
            })?;

        match template {
            Some(template) => {
                settings.message_templates.insert(entity_id.clone(), template);
            }
            None => {
                settings.message_templates.remove(entity_id);
            }
        }
        Ok(())
    }

    async fn list_entities(&self, community_id: CommunityId) -> Result<Vec<EntityId>> {
        Ok(self
            .communities
            .read()
            .get(&community_id)
            .map(|s| s.entities.clone())
            .unwrap_or_default())
    }

    async fn list_communities(&self) -> Result<Vec<CommunityId>> {
        Ok(self.communities.read().keys().copied().collect())
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let communities = self.communities.read();
        Ok(RegistryStats {
            communities: communities.len(),
            entities: communities.values().map(|s| s.entities.len()).sum(),
            templates: communities.values().map(|s| s.message_templates.len()).sum(),
        })
    }
}
