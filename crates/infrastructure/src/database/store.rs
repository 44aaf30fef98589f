use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite, sqlite::SqlitePoolOptions};

use domain::DomainError;
use domain::identity::DeviceIdentity;
use domain::state::TargetState;
use domain::store::DeviceStore;

/// Embedded single-writer store backing identity, target state, sensor
/// output history, and discovery metadata.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

fn store_err(e: sqlx::Error) -> DomainError {
    DomainError::Store(e.to_string())
}

impl SqliteStore {
    pub async fn new(connection_string: &str) -> Result<Self, DomainError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite is single-writer
            .connect(connection_string)
            .await
            .map_err(store_err)?;

        // The device row must survive crashes; pay the fsync on every commit.
        sqlx::query("PRAGMA synchronous = FULL")
            .execute(&pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS device (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                document TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS target_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                document TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensor_outputs (
                id INTEGER PRIMARY KEY,
                device_name TEXT NOT NULL,
                register_name TEXT NOT NULL,
                frame TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        Ok(Self { pool })
    }

    /// Keep a bounded trail of recent frames for the local API.
    pub async fn record_sensor_output(
        &self,
        frame: &domain::SensorFrame,
    ) -> Result<(), DomainError> {
        let json = serde_json::to_string(frame)
            .map_err(|e| DomainError::Store(format!("serialize frame: {e}")))?;
        sqlx::query(
            "INSERT INTO sensor_outputs (device_name, register_name, frame, created_at)
             VALUES (?, ?, ?, strftime('%s','now'))",
        )
        .bind(&frame.device_name)
        .bind(&frame.register_name)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "DELETE FROM sensor_outputs WHERE id NOT IN
             (SELECT id FROM sensor_outputs ORDER BY id DESC LIMIT 1000)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn recent_sensor_outputs(
        &self,
        limit: i64,
    ) -> Result<Vec<domain::SensorFrame>, DomainError> {
        let rows =
            sqlx::query("SELECT frame FROM sensor_outputs ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        let mut frames = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get(0);
            if let Ok(frame) = serde_json::from_str(&json) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn load_device(&self) -> Result<Option<DeviceIdentity>, DomainError> {
        let row = sqlx::query("SELECT document FROM device WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let json: String = row.get(0);
                let identity = serde_json::from_str(&json)
                    .map_err(|e| DomainError::Fatal(format!("identity row corrupt: {e}")))?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    async fn save_device(&self, identity: &DeviceIdentity) -> Result<(), DomainError> {
        let json = serde_json::to_string(identity)
            .map_err(|e| DomainError::Store(format!("serialize identity: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            "INSERT INTO device (id, document, updated_at) VALUES (1, ?, strftime('%s','now'))
             ON CONFLICT(id) DO UPDATE SET document = excluded.document,
                                           updated_at = excluded.updated_at",
        )
        .bind(json)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn load_target_state(&self) -> Result<Option<TargetState>, DomainError> {
        let row = sqlx::query("SELECT document FROM target_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let json: String = row.get(0);
                let state = serde_json::from_str(&json)
                    .map_err(|e| DomainError::Store(format!("target state row corrupt: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save_target_state(&self, state: &TargetState) -> Result<(), DomainError> {
        let json = serde_json::to_string(state)
            .map_err(|e| DomainError::Store(format!("serialize target state: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            "INSERT INTO target_state (id, document, version, updated_at)
             VALUES (1, ?, ?, strftime('%s','now'))
             ON CONFLICT(id) DO UPDATE SET document = excluded.document,
                                           version = excluded.version,
                                           updated_at = excluded.updated_at",
        )
        .bind(json)
        .bind(state.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, DomainError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(value)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn clear_workload_state(&self) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for table in ["target_state", "metadata", "sensor_outputs"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}
