//! Metadata store test utilities.

#![allow(dead_code)]

use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{ObjectId, ObjectMeta, TableColumn, TableVersion};
use strata_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Prefix of the error returned when the PostgreSQL container cannot start.
/// Tests skip on it instead of failing.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A test metadata store wrapper that cleans up on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    sqlite_store: Arc<SqliteStore>,
    db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path, 10).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            db_path,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// A second store on the same database file, as another process would
    /// open it.
    pub async fn second_store(&self) -> MetadataResult<Arc<dyn MetadataStore>> {
        Ok(Arc::new(SqliteStore::new(&self.db_path, 10).await?))
    }

    /// Raw pool for assertions the repository traits do not expose.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// PostgreSQL store backed by a throwaway container.
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    postgres_store: Arc<PostgresStore>,
    url: String,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let store = Arc::new(PostgresStore::from_url(&url, 5, None).await?);
        Ok(Self {
            store: store.clone(),
            postgres_store: store,
            url,
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// A second store with its own pool on the same database.
    pub async fn second_store(&self) -> MetadataResult<Arc<dyn MetadataStore>> {
        Ok(Arc::new(PostgresStore::from_url(&self.url, 5, None).await?))
    }

    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres_store.pool()
    }
}

/// Start a PostgreSQL store, or `None` when Docker is unavailable or
/// `SKIP_POSTGRES_TESTS` is set. Other setup failures panic.
pub async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::new().await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

pub fn oid(seed: &str) -> ObjectId {
    ObjectId::from_content(seed.as_bytes())
}

pub fn meta(seed: &str, size: u64) -> ObjectMeta {
    ObjectMeta::snapshot(oid(seed), "test", size)
}

pub fn table(name: &str, objects: Vec<ObjectId>) -> TableVersion {
    TableVersion {
        namespace: "test".to_string(),
        repository: "repo".to_string(),
        image_hash: "0123456789abcdef".to_string(),
        table_name: name.to_string(),
        schema: vec![TableColumn::new(1, "id", "integer")],
        objects,
    }
}
