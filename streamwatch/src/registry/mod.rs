//! Watch registry.
//!
//! The registry holds, per community, the watched entities, the destination
//! notifications go to, and optional per-entity message templates. The
//! monitor only ever reads it through [`WatchRegistry::snapshot`]; the
//! mutating [`WatchStore`] surface belongs to the command layer.

mod fallback;
mod memory;
mod sqlite;

pub use fallback::{RegistryBackend, open_registry};
pub use memory::{CommunitySettings, InMemoryWatchRegistry};
pub use sqlite::SqliteWatchRegistry;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Canonical (trimmed, lowercase) channel login on the external platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    /// Canonicalize and check that `raw` looks like a channel login.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let id = Self::new(raw);
        if id.0.is_empty() || id.0.len() > 25 {
            return Err(Error::validation(format!(
                "channel name must be 1 to 25 characters, got {:?}",
                id.0
            )));
        }
        if !id.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(format!(
                "channel name may only contain letters, digits and underscores: {:?}",
                id.0
            )));
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Identifier of a community (a chat server) that watches entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(pub u64);

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque address the delivery layer posts a community's notifications to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationSink(String);

impl DestinationSink {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One (community, entity) watch, as seen by the monitor for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub community_id: CommunityId,
    pub entity_id: EntityId,
    pub destination: DestinationSink,
    pub message_template: Option<String>,
}

/// Per-community limits enforced on mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_entities_per_community: usize,
    pub max_template_len: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_entities_per_community: 50,
            max_template_len: 1000,
        }
    }
}

impl RegistryLimits {
    pub(crate) fn check_template(&self, template: &str) -> Result<()> {
        let len = template.chars().count();
        if len > self.max_template_len {
            return Err(Error::validation(format!(
                "message template is {} characters, limit is {}",
                len, self.max_template_len
            )));
        }
        Ok(())
    }

    pub(crate) fn check_capacity(&self, community_id: CommunityId, current: usize) -> Result<()> {
        if current >= self.max_entities_per_community {
            return Err(Error::validation(format!(
                "community {} already watches {} channels (limit {})",
                community_id, current, self.max_entities_per_community
            )));
        }
        Ok(())
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub communities: usize,
    pub entities: usize,
    pub templates: usize,
}

/// Read side of the registry used by the monitor.
#[async_trait]
pub trait WatchRegistry: Send + Sync {
    /// Point-in-time list of all watches whose community has a destination,
    /// ordered by community, then by the order entities were added.
    async fn snapshot(&self) -> Result<Vec<WatchEntry>>;
}

/// Mutation surface for the command layer.
#[async_trait]
pub trait WatchStore: WatchRegistry {
    /// Returns `false` if the community already existed.
    async fn create_community(&self, community_id: CommunityId) -> Result<bool>;

    /// Returns `false` if the community did not exist.
    async fn delete_community(&self, community_id: CommunityId) -> Result<bool>;

    /// Returns `false` if the entity was already watched.
    async fn add_entity(&self, community_id: CommunityId, entity_id: &EntityId) -> Result<bool>;

    /// Removes the watch and its template. Returns `false` if it was not watched.
    async fn remove_entity(&self, community_id: CommunityId, entity_id: &EntityId)
    -> Result<bool>;

    async fn set_destination(
        &self,
        community_id: CommunityId,
        destination: DestinationSink,
    ) -> Result<()>;

    /// Set or clear the template of a watched entity.
    async fn set_message_template(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
        template: Option<String>,
    ) -> Result<()>;

    async fn list_entities(&self, community_id: CommunityId) -> Result<Vec<EntityId>>;

    async fn list_communities(&self) -> Result<Vec<CommunityId>>;

    async fn stats(&self) -> Result<RegistryStats>;
}

/// Distinct entities referenced by a snapshot.
pub fn entity_set(entries: &[WatchEntry]) -> BTreeSet<EntityId> {
    entries.iter().map(|e| e.entity_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_case_insensitive() {
        assert_eq!(EntityId::new("  Alpha "), EntityId::new("alpha"));
        assert_eq!(EntityId::new("ALPHA").as_str(), "alpha");
    }

    #[test]
    fn test_entity_id_parse() {
        assert!(EntityId::parse("some_streamer42").is_ok());
        assert!(EntityId::parse("").is_err());
        assert!(EntityId::parse("has space").is_err());
        assert!(EntityId::parse("a".repeat(26)).is_err());
    }

    #[test]
    fn test_entity_id_deserialize_canonicalizes() {
        let id: EntityId = serde_json::from_str(r#""MixedCase""#).unwrap();
        assert_eq!(id.as_str(), "mixedcase");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""mixedcase""#);
    }

    #[test]
    fn test_entity_set_dedupes() {
        let entry = |c: u64, e: &str| WatchEntry {
            community_id: CommunityId(c),
            entity_id: EntityId::new(e),
            destination: DestinationSink::new("dest"),
            message_template: None,
        };
        let set = entity_set(&[entry(1, "alpha"), entry(2, "Alpha"), entry(2, "beta")]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_limits() {
        let limits = RegistryLimits::default();
        assert!(limits.check_template(&"x".repeat(1000)).is_ok());
        assert!(limits.check_template(&"x".repeat(1001)).is_err());
        assert!(limits.check_capacity(CommunityId(1), 49).is_ok());
        assert!(limits.check_capacity(CommunityId(1), 50).is_err());
    }
}
