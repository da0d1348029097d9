//! Embedded persistence layer: the single source of truth for instances,
//! port reservations, Ollama model records, and settings.
//!
//! One shared `SqlitePool` is opened at startup and handed around; the
//! database client never leaks out of this module. Every multi-row mutation
//! runs in a transaction so callers cannot observe partial writes.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    EngineKind, GpuAssignment, Instance, InstanceConfig, InstanceStatus, ModelStatus, OllamaModel,
};

/// Errors from the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict on {field}")]
    Conflict { field: &'static str },

    #[error("record not found")]
    NotFound,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A row in the reservations table: "this system believes port P is in use
/// by instance I". `instance_id` may dangle; the reconciler cleans that up.
#[derive(Debug, Clone, PartialEq)]
pub struct PortReservation {
    pub port: u16,
    pub instance_id: Uuid,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn table(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::Vllm => "instances",
        EngineKind::Ollama => "ollama_instances",
    }
}

impl Store {
    /// Open (creating if missing) the database at `path` and bring the
    /// schema up to date. `:memory:` is supported for tests.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Db)?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        }
        .busy_timeout(std::time::Duration::from_secs(5))
        .foreign_keys(true);

        // A pooled in-memory database would give each connection its own
        // empty database, so pin it to a single connection.
        let max_connections = if path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables on first run and apply additive migrations. Safe to
    /// run on every startup and against databases created by any prior
    /// version of the schema.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for kind_table in ["instances", "ollama_instances"] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {kind_table} (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    model_ref TEXT,
                    port INTEGER NOT NULL UNIQUE,
                    container_id TEXT,
                    status TEXT NOT NULL,
                    config TEXT NOT NULL DEFAULT '{{}}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ))
            .execute(&self.pool)
            .await?;

            // Columns added after the first release; older databases lack
            // them, so guard with table_info instead of failing.
            self.ensure_column(kind_table, "api_key_hash", "TEXT").await?;
            self.ensure_column(kind_table, "gpu_id", "TEXT").await?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS allocated_ports (
                port INTEGER PRIMARY KEY,
                instance_id TEXT NOT NULL,
                allocated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ollama_models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                size INTEGER,
                digest TEXT,
                modified_at TEXT,
                UNIQUE(instance_id, name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        debug!("database schema is up to date");
        Ok(())
    }

    async fn ensure_column(
        &self,
        table: &str,
        column: &str,
        ty: &str,
    ) -> Result<(), StoreError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;
        let exists = rows
            .iter()
            .any(|row| row.get::<String, _>("name") == column);
        if !exists {
            info!(table, column, "applying additive migration");
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ty}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ── Instances ───────────────────────────────────────────────────────

    pub async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let config = serde_json::to_string(&instance.config)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(&format!(
            "INSERT INTO {} (id, name, model_ref, port, container_id, status,
                             api_key_hash, gpu_id, config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table(instance.kind)
        ))
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(&instance.model_ref)
        .bind(instance.port as i64)
        .bind(&instance.container_id)
        .bind(instance.status.as_str())
        .bind(&instance.api_key_hash)
        .bind(instance.gpu.to_column())
        .bind(config)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(map_unique_violation(e)),
        }
    }

    /// Replace the mutable fields of an instance row. `id`, `kind` and
    /// `created_at` never change; `updated_at` is stamped here.
    pub async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let config = serde_json::to_string(&instance.config)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET name = ?, model_ref = ?, port = ?, container_id = ?,
                           status = ?, api_key_hash = ?, gpu_id = ?, config = ?,
                           updated_at = ?
             WHERE id = ?",
            table(instance.kind)
        ))
        .bind(&instance.name)
        .bind(&instance.model_ref)
        .bind(instance.port as i64)
        .bind(&instance.container_id)
        .bind(instance.status.as_str())
        .bind(&instance.api_key_hash)
        .bind(instance.gpu.to_column())
        .bind(config)
        .bind(Utc::now())
        .bind(instance.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn update_status(
        &self,
        kind: EngineKind,
        id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE id = ?",
            table(kind)
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete an instance row, cascading to its model records.
    pub async fn delete_instance(&self, kind: EngineKind, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table(kind)))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        if kind == EngineKind::Ollama {
            sqlx::query("DELETE FROM ollama_models WHERE instance_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_instance(
        &self,
        kind: EngineKind,
        id: Uuid,
    ) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", table(kind)))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| instance_from_row(&r, kind)).transpose()
    }

    pub async fn list_instances(
        &self,
        kind: EngineKind,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT * FROM {} WHERE status = ? ORDER BY created_at",
                    table(kind)
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT * FROM {} ORDER BY created_at", table(kind)))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(|r| instance_from_row(r, kind)).collect()
    }

    /// Whether any instance (of either kind) has this id.
    pub async fn instance_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        for kind in [EngineKind::Vllm, EngineKind::Ollama] {
            let row = sqlx::query(&format!("SELECT 1 FROM {} WHERE id = ?", table(kind)))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            if row.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether any instance record claims this container.
    pub async fn container_known(&self, container_id: &str) -> Result<bool, StoreError> {
        for kind in [EngineKind::Vllm, EngineKind::Ollama] {
            let row = sqlx::query(&format!(
                "SELECT 1 FROM {} WHERE container_id = ?",
                table(kind)
            ))
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await?;
            if row.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether another instance of this kind also points at the container.
    /// Ollama records can share one container; removal must not take the
    /// container down while a sibling still uses it.
    pub async fn container_shared(
        &self,
        kind: EngineKind,
        container_id: &str,
        excluding: Uuid,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE container_id = ? AND id != ? LIMIT 1",
            table(kind)
        ))
        .bind(container_id)
        .bind(excluding.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert an imported orphan and its port reservation atomically. On
    /// any failure neither row lands.
    pub async fn import_orphan(&self, instance: &Instance) -> Result<(), StoreError> {
        let config = serde_json::to_string(&instance.config)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (id, name, model_ref, port, container_id, status,
                             api_key_hash, gpu_id, config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table(instance.kind)
        ))
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(&instance.model_ref)
        .bind(instance.port as i64)
        .bind(&instance.container_id)
        .bind(instance.status.as_str())
        .bind(&instance.api_key_hash)
        .bind(instance.gpu.to_column())
        .bind(config)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            return Err(map_unique_violation(e));
        }

        let reserved = sqlx::query(
            "INSERT INTO allocated_ports (port, instance_id, allocated_at) VALUES (?, ?, ?)",
        )
        .bind(instance.port as i64)
        .bind(instance.id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;
        if let Err(e) = reserved {
            return Err(map_unique_violation(e));
        }

        tx.commit().await?;
        Ok(())
    }

    // ── Port reservations ───────────────────────────────────────────────

    pub async fn reserve_port(&self, port: u16, instance_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO allocated_ports (port, instance_id, allocated_at) VALUES (?, ?, ?)",
        )
        .bind(port as i64)
        .bind(instance_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(map_unique_violation(e)),
        }
    }

    /// Returns true if a reservation was actually deleted; absent is fine.
    pub async fn release_port(&self, port: u16) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM allocated_ports WHERE port = ?")
            .bind(port as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_reservations(&self) -> Result<Vec<PortReservation>, StoreError> {
        let rows = sqlx::query(
            "SELECT port, instance_id, allocated_at FROM allocated_ports ORDER BY port",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let instance_id: String = row.get("instance_id");
                Ok(PortReservation {
                    port: row.get::<i64, _>("port") as u16,
                    instance_id: Uuid::parse_str(&instance_id)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    allocated_at: row.get("allocated_at"),
                })
            })
            .collect()
    }

    pub async fn port_owner(&self, port: u16) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT instance_id FROM allocated_ports WHERE port = ?")
            .bind(port as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.get("instance_id");
                Uuid::parse_str(&raw)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            }
        }
    }

    pub async fn lookup_port(&self, instance_id: Uuid) -> Result<Option<u16>, StoreError> {
        let row = sqlx::query("SELECT port FROM allocated_ports WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("port") as u16))
    }

    // ── Ollama model records ────────────────────────────────────────────

    pub async fn list_models(&self, instance_id: Uuid) -> Result<Vec<OllamaModel>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ollama_models WHERE instance_id = ? ORDER BY name")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(model_from_row).collect()
    }

    pub async fn get_model(
        &self,
        instance_id: Uuid,
        name: &str,
    ) -> Result<Option<OllamaModel>, StoreError> {
        let row = sqlx::query("SELECT * FROM ollama_models WHERE instance_id = ? AND name = ?")
            .bind(instance_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    pub async fn upsert_model(
        &self,
        instance_id: Uuid,
        name: &str,
        status: ModelStatus,
        size: Option<i64>,
        digest: Option<&str>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ollama_models (instance_id, name, status, size, digest, modified_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(instance_id, name) DO UPDATE SET
                 status = excluded.status,
                 size = COALESCE(excluded.size, ollama_models.size),
                 digest = COALESCE(excluded.digest, ollama_models.digest),
                 modified_at = COALESCE(excluded.modified_at, ollama_models.modified_at)",
        )
        .bind(instance_id.to_string())
        .bind(name)
        .bind(status.as_str())
        .bind(size)
        .bind(digest)
        .bind(modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_model(&self, instance_id: Uuid, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM ollama_models WHERE instance_id = ? AND name = ?")
            .bind(instance_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Derived views & settings ────────────────────────────────────────

    /// Count of running instances per stored gpu_id, across both kinds.
    pub async fn gpu_usage(&self) -> Result<HashMap<String, u32>, StoreError> {
        let mut usage: HashMap<String, u32> = HashMap::new();
        for kind in [EngineKind::Vllm, EngineKind::Ollama] {
            let rows = sqlx::query(&format!(
                "SELECT gpu_id, COUNT(*) AS n FROM {}
                 WHERE status = 'running' AND gpu_id IS NOT NULL
                 GROUP BY gpu_id",
                table(kind)
            ))
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let gpu_id: String = row.get("gpu_id");
                let n: i64 = row.get("n");
                *usage.entry(gpu_id).or_insert(0) += n as u32;
            }
        }
        Ok(usage)
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn map_unique_violation(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e
        && db.is_unique_violation()
    {
        let message = db.message().to_string();
        let field = if message.contains(".port") || message.contains("allocated_ports") {
            "port"
        } else if message.contains(".id") {
            "id"
        } else {
            "unique"
        };
        return StoreError::Conflict { field };
    }
    StoreError::Db(e)
}

fn instance_from_row(row: &SqliteRow, kind: EngineKind) -> Result<Instance, StoreError> {
    let id_raw: String = row.get("id");
    let status_raw: String = row.get("status");
    let config_raw: String = row.get("config");
    let gpu_raw: Option<String> = row.get("gpu_id");

    let config: InstanceConfig = serde_json::from_str(&config_raw)
        .map_err(|e| StoreError::Corrupt(format!("config for {id_raw}: {e}")))?;

    Ok(Instance {
        id: Uuid::parse_str(&id_raw).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        kind,
        name: row.get("name"),
        model_ref: row.get("model_ref"),
        port: row.get::<i64, _>("port") as u16,
        container_id: row.get("container_id"),
        status: InstanceStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status_raw:?}")))?,
        api_key_hash: row.get("api_key_hash"),
        gpu: GpuAssignment::from_column(gpu_raw.as_deref()),
        config,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn model_from_row(row: &SqliteRow) -> Result<OllamaModel, StoreError> {
    let instance_id: String = row.get("instance_id");
    let status_raw: String = row.get("status");
    Ok(OllamaModel {
        id: row.get("id"),
        instance_id: Uuid::parse_str(&instance_id)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        name: row.get("name"),
        status: ModelStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("model status {status_raw:?}")))?,
        size: row.get("size"),
        digest: row.get("digest"),
        modified_at: row.get("modified_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::connect(":memory:").await.unwrap()
    }

    fn test_instance(kind: EngineKind, port: u16) -> Instance {
        let now = Utc::now();
        Instance {
            id: Uuid::new_v4(),
            kind,
            name: "test".to_string(),
            model_ref: (kind == EngineKind::Vllm).then(|| "org/model".to_string()),
            port,
            container_id: Some("abc123".to_string()),
            status: InstanceStatus::Running,
            api_key_hash: None,
            gpu: GpuAssignment::Cpu,
            config: InstanceConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let store = memory_store().await;
        let instance = test_instance(EngineKind::Vllm, 8001);

        store.create_instance(&instance).await.unwrap();
        let loaded = store
            .get_instance(EngineKind::Vllm, instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "test");
        assert_eq!(loaded.port, 8001);
        assert_eq!(loaded.model_ref.as_deref(), Some("org/model"));
        assert_eq!(loaded.status, InstanceStatus::Running);

        store
            .delete_instance(EngineKind::Vllm, instance.id)
            .await
            .unwrap();
        assert!(
            store
                .get_instance(EngineKind::Vllm, instance.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let store = memory_store().await;
        let instance = test_instance(EngineKind::Vllm, 8001);
        store.create_instance(&instance).await.unwrap();

        let mut dup = instance.clone();
        dup.port = 8002;
        let err = store.create_instance(&dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { field: "id" }));
    }

    #[tokio::test]
    async fn duplicate_port_conflicts() {
        let store = memory_store().await;
        store
            .create_instance(&test_instance(EngineKind::Vllm, 8001))
            .await
            .unwrap();
        let err = store
            .create_instance(&test_instance(EngineKind::Vllm, 8001))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { field: "port" }));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = memory_store().await;
        let err = store
            .delete_instance(EngineKind::Vllm, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn reserve_port_twice_conflicts() {
        let store = memory_store().await;
        let id = Uuid::new_v4();
        store.reserve_port(8001, id).await.unwrap();
        let err = store.reserve_port(8001, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { field: "port" }));

        assert!(store.release_port(8001).await.unwrap());
        assert!(!store.release_port(8001).await.unwrap());
        store.reserve_port(8001, id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_ollama_instance_cascades_models() {
        let store = memory_store().await;
        let instance = test_instance(EngineKind::Ollama, 8005);
        store.create_instance(&instance).await.unwrap();
        store
            .upsert_model(instance.id, "llama3:8b", ModelStatus::Ready, Some(42), None, None)
            .await
            .unwrap();
        assert_eq!(store.list_models(instance.id).await.unwrap().len(), 1);

        store
            .delete_instance(EngineKind::Ollama, instance.id)
            .await
            .unwrap();
        assert!(store.list_models(instance.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_model_transitions_status() {
        let store = memory_store().await;
        let instance = test_instance(EngineKind::Ollama, 8005);
        store.create_instance(&instance).await.unwrap();

        store
            .upsert_model(instance.id, "m:1", ModelStatus::Downloading, None, None, None)
            .await
            .unwrap();
        store
            .upsert_model(
                instance.id,
                "m:1",
                ModelStatus::Ready,
                Some(1000),
                Some("sha256:aa"),
                None,
            )
            .await
            .unwrap();

        let model = store.get_model(instance.id, "m:1").await.unwrap().unwrap();
        assert_eq!(model.status, ModelStatus::Ready);
        assert_eq!(model.size, Some(1000));
        assert_eq!(model.digest.as_deref(), Some("sha256:aa"));
    }

    #[tokio::test]
    async fn import_orphan_is_atomic() {
        let store = memory_store().await;
        // Occupy the port so the reservation insert fails.
        store.reserve_port(8009, Uuid::new_v4()).await.unwrap();

        let orphan = test_instance(EngineKind::Vllm, 8009);
        let err = store.import_orphan(&orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { field: "port" }));

        // The instance insert must have rolled back with it.
        assert!(
            store
                .get_instance(EngineKind::Vllm, orphan.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn gpu_usage_counts_running_only() {
        let store = memory_store().await;
        let mut a = test_instance(EngineKind::Vllm, 8001);
        a.gpu = GpuAssignment::Device(0);
        let mut b = test_instance(EngineKind::Vllm, 8002);
        b.id = Uuid::new_v4();
        b.gpu = GpuAssignment::Device(0);
        b.status = InstanceStatus::Stopped;
        store.create_instance(&a).await.unwrap();
        store.create_instance(&b).await.unwrap();

        let usage = store.gpu_usage().await.unwrap();
        assert_eq!(usage.get("0"), Some(&1));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = memory_store().await;
        assert!(store.get_setting("default_api_key").await.unwrap().is_none());
        store.set_setting("default_api_key", "sk-x").await.unwrap();
        store.set_setting("default_api_key", "sk-y").await.unwrap();
        assert_eq!(
            store.get_setting("default_api_key").await.unwrap().as_deref(),
            Some("sk-y")
        );
    }
}
