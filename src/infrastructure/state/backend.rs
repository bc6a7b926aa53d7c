use crate::domain::errors::StateError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// Storage backend for the serialized state document. Both backends share the
/// same contract: a torn write must leave the previous payload readable.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn read(&self) -> Result<Option<String>, StateError>;
    async fn write(&self, payload: &str) -> Result<(), StateError>;
}

/// JSON file backend. Writes go to a temp file in the same directory followed
/// by an atomic rename over the target.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    async fn read(&self) -> Result<Option<String>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&self.path)?))
    }

    async fn write(&self, payload: &str) -> Result<(), StateError> {
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, payload)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// SQLite backend: the whole document lives in a single row, updated with a
/// transactional upsert.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn connect(db_path: &str) -> Result<Self, StateError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trader_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn read(&self) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT payload FROM trader_state WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(row.map(|r| r.get::<String, _>("payload")))
    }

    async fn write(&self, payload: &str) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO trader_state (id, payload, updated_at)
             VALUES (0, ?1, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                                           updated_at = excluded.updated_at",
        )
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(())
    }
}
