//! Persistence Store for spawned objects.
//!
//! The store is the source of truth; the relay's Object Registry is a cache
//! that is written only after the store accepts a write.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::objects::SpawnedObject;
use crate::vec3::Vec3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} already exists")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported store url {0:?}")]
    UnsupportedUrl(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every stored object, oldest first.
    async fn load_all(&self) -> Result<Vec<SpawnedObject>, StoreError>;

    /// Durable write. Fails with `Duplicate` if the id is taken.
    async fn insert(&self, object: &SpawnedObject) -> Result<(), StoreError>;

    /// Delete every object owned by `owner`. Returns how many were removed.
    async fn delete_by_owner(&self, owner: &str) -> Result<u64, StoreError>;

    /// Delete one object by id. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// Open the store named by a connection string: `memory` or `sqlite:...`.
pub async fn open_store(url: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if url == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::connect(url).await?));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

// === In-memory ===

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, SpawnedObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<SpawnedObject>, StoreError> {
        let objects = self.objects.lock().await;
        let mut all: Vec<SpawnedObject> = objects.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn insert(&self, object: &SpawnedObject) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(&object.id) {
            return Err(StoreError::Duplicate(object.id.clone()));
        }
        objects.insert(object.id.clone(), object.clone());
        Ok(())
    }

    async fn delete_by_owner(&self, owner: &str) -> Result<u64, StoreError> {
        let mut objects = self.objects.lock().await;
        let before = objects.len();
        objects.retain(|_, o| o.owner_id != owner);
        Ok((before - objects.len()) as u64)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().await.remove(id).is_some())
    }
}

// === SQLite ===

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS spawned_objects (
    id TEXT PRIMARY KEY NOT NULL,
    asset_id TEXT NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL,
    player_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
)";

const CREATE_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS spawned_objects_player_id ON spawned_objects (player_id)";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Each connection to an in-memory database sees its own database,
        // so keep exactly one connection alive for the pool's lifetime.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_OWNER_INDEX).execute(&pool).await?;

        tracing::info!("Opened sqlite object store at {}", url);
        Ok(Self { pool })
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn load_all(&self) -> Result<Vec<SpawnedObject>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, asset_id, x, y, z, player_id, created_at
             FROM spawned_objects ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SpawnedObject, StoreError> {
                let created_at: i64 = row.try_get("created_at")?;
                Ok(SpawnedObject {
                    id: row.try_get("id")?,
                    asset_id: row.try_get("asset_id")?,
                    position: Vec3::new(row.try_get("x")?, row.try_get("y")?, row.try_get("z")?),
                    owner_id: row.try_get("player_id")?,
                    created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn insert(&self, object: &SpawnedObject) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO spawned_objects (id, asset_id, x, y, z, player_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&object.id)
        .bind(&object.asset_id)
        .bind(object.position.x)
        .bind(object.position.y)
        .bind(object.position.z)
        .bind(&object.owner_id)
        .bind(object.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(object.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_by_owner(&self, owner: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM spawned_objects WHERE player_id = ?")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM spawned_objects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
