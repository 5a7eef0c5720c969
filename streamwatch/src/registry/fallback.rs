//! Startup selection between the persistent and in-memory registries.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    CommunityId, DestinationSink, EntityId, InMemoryWatchRegistry, RegistryLimits,
    RegistryStats, SqliteWatchRegistry, WatchEntry, WatchRegistry, WatchStore,
};
use crate::Result;
use crate::config::StorageConfig;

/// Registry chosen at startup.
pub enum RegistryBackend {
    Sqlite(SqliteWatchRegistry),
    Memory(InMemoryWatchRegistry),
}

impl RegistryBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Memory(_) => "memory",
        }
    }

    fn store(&self) -> &dyn WatchStore {
        match self {
            Self::Sqlite(registry) => registry,
            Self::Memory(registry) => registry,
        }
    }
}

/// Open the configured database, or fall back to memory.
///
/// The choice is made once; a database that becomes unavailable later
/// surfaces as snapshot errors rather than a silent switch. The in-memory
/// registry is filled from `seed_path` when one is configured.
pub async fn open_registry(storage: &StorageConfig, limits: RegistryLimits) -> RegistryBackend {
    let Some(url) = storage.database_url.as_deref() else {
        info!("No database configured, using in-memory registry");
        return RegistryBackend::Memory(seeded_memory(storage.seed_path.as_deref(), limits));
    };

    match SqliteWatchRegistry::connect(url, limits).await {
        Ok(registry) => {
            info!("Using SQLite registry");
            RegistryBackend::Sqlite(registry)
        }
        Err(e) => {
            warn!(error = %e, "Database unavailable, falling back to in-memory registry");
            RegistryBackend::Memory(seeded_memory(storage.seed_path.as_deref(), limits))
        }
    }
}

fn seeded_memory(seed_path: Option<&Path>, limits: RegistryLimits) -> InMemoryWatchRegistry {
    let registry = InMemoryWatchRegistry::with_limits(limits);

    if let Some(path) = seed_path
        && let Err(e) = registry.import_file(path)
    {
        warn!(path = %path.display(), error = %e, "Failed to load registry seed");
    }

    if registry.is_empty() {
        warn!("In-memory registry is empty, nothing will be monitored");
    }
    registry
}

#[async_trait]
impl WatchRegistry for RegistryBackend {
    async fn snapshot(&self) -> Result<Vec<WatchEntry>> {
        self.store().snapshot().await
    }
}

#[async_trait]
impl WatchStore for RegistryBackend {
    async fn create_community(&self, community_id: CommunityId) -> Result<bool> {
        self.store().create_community(community_id).await
    }

    async fn delete_community(&self, community_id: CommunityId) -> Result<bool> {
        self.store().delete_community(community_id).await
    }

    async fn add_entity(&self, community_id: CommunityId, entity_id: &EntityId) -> Result<bool> {
        self.store().add_entity(community_id, entity_id).await
    }

    async fn remove_entity(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
    ) -> Result<bool> {
        self.store().remove_entity(community_id, entity_id).await
    }

    async fn set_destination(
        &self,
        community_id: CommunityId,
        destination: DestinationSink,
    ) -> Result<()> {
        self.store().set_destination(community_id, destination).await
    }

    async fn set_message_template(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
        template: Option<String>,
    ) -> Result<()> {
        self.store()
            .set_message_template(community_id, entity_id, template)
            .await
    }

    async fn list_entities(&self, community_id: CommunityId) -> Result<Vec<EntityId>> {
        self.store().list_entities(community_id).await
    }

    async fn list_communities(&self) -> Result<Vec<CommunityId>> {
        self.store().list_communities().await
    }

    async fn stats(&self) -> Result<RegistryStats> {
        self.store().stats().await
    }
}
