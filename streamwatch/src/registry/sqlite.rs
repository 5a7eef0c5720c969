//! SQLite-backed watch registry.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{
    CommunityId, DestinationSink, EntityId, RegistryLimits, RegistryStats, WatchEntry,
    WatchRegistry, WatchStore,
};
use crate::{Error, Result};

/// Busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// Registry persisted in a SQLite database.
///
/// Writes are serialized through a single pooled connection.
pub struct SqliteWatchRegistry {
    pool: SqlitePool,
    limits: RegistryLimits,
}

impl SqliteWatchRegistry {
    /// Open (creating if missing) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str, limits: RegistryLimits) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options, limits).await
    }

    /// Open (creating if missing) the database file at `path`.
    pub async fn open_file(path: &Path, limits: RegistryLimits) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options, limits).await
    }

    async fn connect_with(options: SqliteConnectOptions, limits: RegistryLimits) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!("Running registry migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Registry database ready");

        Ok(Self { pool, limits })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_db_id(community_id: CommunityId) -> Result<i64> {
    i64::try_from(community_id.0).map_err(|_| {
        Error::validation(format!("community id {} is out of range", community_id))
    })
}

fn from_db_id(id: i64) -> Result<CommunityId> {
    u64::try_from(id)
        .map(CommunityId)
        .map_err(|_| Error::Corrupt(format!("negative community id {}", id)))
}

#[async_trait]
impl WatchRegistry for SqliteWatchRegistry {
    async fn snapshot(&self) -> Result<Vec<WatchEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.destination, w.entity_id, w.message_template
            FROM watch_entries w
            JOIN communities c ON c.id = w.community_id
            WHERE c.destination IS NOT NULL
            ORDER BY c.id, w.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<WatchEntry> {
                Ok(WatchEntry {
                    community_id: from_db_id(row.try_get("id")?)?,
                    destination: DestinationSink::new(row.try_get::<String, _>("destination")?),
                    entity_id: EntityId::new(row.try_get::<String, _>("entity_id")?),
                    message_template: row.try_get("message_template")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WatchStore for SqliteWatchRegistry {
    async fn create_community(&self, community_id: CommunityId) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO communities (id) VALUES (?)")
            .bind(to_db_id(community_id)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_community(&self, community_id: CommunityId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM communities WHERE id = ?")
            .bind(to_db_id(community_id)?)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(community = %community_id, "Deleted community");
        }
        Ok(removed)
    }

    async fn add_entity(&self, community_id: CommunityId, entity_id: &EntityId) -> Result<bool> {
        let id = to_db_id(community_id)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO communities (id) VALUES (?)")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM watch_entries WHERE community_id = ? AND entity_id = ?",
        )
        .bind(id)
        .bind(entity_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            return Ok(false);
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM watch_entries WHERE community_id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        self.limits
            .check_capacity(community_id, usize::try_from(count).unwrap_or(usize::MAX))?;

        sqlx::query("INSERT INTO watch_entries (community_id, entity_id) VALUES (?, ?)")
            .bind(id)
            .bind(entity_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(community = %community_id, entity = %entity_id, "Added watched channel");
        Ok(true)
    }

    async fn remove_entity(
        &self,
        community_id: CommunityId,
        entity_id: &EntityId,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM watch_entries WHERE community_id = ? AND entity_id = ?")
                .bind(to_db_id(community_id)?)
                .bind(entity_id.as_str())
                .execute(&self.pool)
                .await?;
        let removed = result.rows_affected() > 0;
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
        sqlx::query(
            r#"
            INSERT INTO communities (id, destination) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET destination = excluded.destination
            "#,
        )
        .bind(to_db_id(community_id)?)
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;
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

        let result = sqlx::query(
            "UPDATE watch_entries SET message_template = ? WHERE community_id = ? AND entity_id = ?",
        )
        .bind(template)
        .bind(to_db_id(community_id)?)
        .bind(entity_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                "Watch",
                format!("{}/{}", community_id, entity_id),
            ));
        }
        Ok(())
    }

    async fn list_entities(&self, community_id: CommunityId) -> Result<Vec<EntityId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT entity_id FROM watch_entries WHERE community_id = ? ORDER BY rowid",
        )
        .bind(to_db_id(community_id)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(EntityId::from).collect())
    }

    async fn list_communities(&self) -> Result<Vec<CommunityId>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM communities ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        ids.into_iter().map(from_db_id).collect()
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM communities) AS communities,
                (SELECT COUNT(*) FROM watch_entries) AS entities,
                (SELECT COUNT(*) FROM watch_entries WHERE message_template IS NOT NULL) AS templates
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<usize> {
            let n: i64 = row.try_get(name)?;
            Ok(usize::try_from(n).unwrap_or_default())
        };

        Ok(RegistryStats {
            communities: count("communities")?,
            entities: count("entities")?,
            templates: count("templates")?,
        })
    }
}
