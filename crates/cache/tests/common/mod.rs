//! Cache manager test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_cache::{ObjectCacheManager, Remote};
use strata_core::config::CacheConfig;
use strata_core::{ObjectId, ObjectMeta, TableColumn, TableVersion};
use strata_metadata::{MetadataStore, ObjectRepo, SqliteStore};
use strata_storage::{
    FilesystemBackend, ObjectStore, ObjectStoreExt, StorageResult, StoredObjectMeta,
};
use tempfile::TempDir;
use time::OffsetDateTime;

/// Filesystem store that counts writes, to tell how often an object was
/// actually fetched.
pub struct CountingStore {
    inner: FilesystemBackend,
    puts: AtomicUsize,
}

impl CountingStore {
    pub async fn new(root: impl AsRef<std::path::Path>) -> Self {
        Self {
            inner: FilesystemBackend::new(root)
                .await
                .expect("Failed to create object store"),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<StoredObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}

/// Local cache environment: one SQLite metadata store and one object store
/// in a temp directory.
pub struct TestEnv {
    pub metadata: Arc<dyn MetadataStore>,
    sqlite: Arc<SqliteStore>,
    pub objects: Arc<CountingStore>,
    db_path: PathBuf,
    objects_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("metadata.db");
        let objects_path = temp_dir.path().join("objects");

        let sqlite = Arc::new(
            SqliteStore::new(&db_path, 10)
                .await
                .expect("Failed to create metadata store"),
        );
        let objects = Arc::new(CountingStore::new(&objects_path).await);

        Self {
            metadata: sqlite.clone(),
            sqlite,
            objects,
            db_path,
            objects_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn manager(&self, capacity: u64) -> ObjectCacheManager {
        ObjectCacheManager::new(
            CacheConfig::with_capacity(capacity),
            self.metadata.clone(),
            self.objects.clone(),
        )
        .expect("Failed to create cache manager")
    }

    /// A manager with its own connection pool and object store handle on
    /// the same files, as another process would open them.
    pub async fn second_manager(&self, capacity: u64) -> ObjectCacheManager {
        let metadata = Arc::new(
            SqliteStore::new(&self.db_path, 10)
                .await
                .expect("Failed to open second metadata store"),
        );
        let objects = Arc::new(
            FilesystemBackend::new(&self.objects_path)
                .await
                .expect("Failed to open second object store"),
        );
        ObjectCacheManager::new(CacheConfig::with_capacity(capacity), metadata, objects)
            .expect("Failed to create second cache manager")
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite.pool()
    }

    /// Write bytes straight into local storage, bypassing the cache.
    pub async fn store_local(&self, seed: &str, size: usize) -> ObjectId {
        let id = oid(seed);
        self.objects
            .put_object(&id, payload(seed, size))
            .await
            .expect("Failed to store object");
        id
    }

    pub async fn register(&self, seed: &str, size: u64) -> ObjectId {
        self.metadata
            .upsert_objects(&[meta(seed, size)])
            .await
            .expect("Failed to register object");
        oid(seed)
    }

    pub async fn has_local(&self, id: &ObjectId) -> bool {
        self.objects.has_object(id).await.expect("has_object failed")
    }

    pub async fn refcount(&self, id: &ObjectId) -> Option<i64> {
        sqlx::query_scalar("SELECT refcount FROM object_cache_status WHERE object_id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await
            .expect("refcount query failed")
    }

    pub async fn is_ready(&self, id: &ObjectId) -> Option<bool> {
        sqlx::query_scalar("SELECT ready FROM object_cache_status WHERE object_id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await
            .expect("ready query failed")
    }

    pub async fn set_last_used(&self, id: &ObjectId, ago: time::Duration) {
        sqlx::query("UPDATE object_cache_status SET last_used = ? WHERE object_id = ?")
            .bind(OffsetDateTime::now_utc() - ago)
            .bind(id.as_str())
            .execute(self.pool())
            .await
            .expect("Failed to update last_used");
    }
}

/// An upstream repository objects can be copied from.
pub struct TestRemote {
    pub remote: Remote,
    _temp_dir: TempDir,
}

impl TestRemote {
    pub async fn new(name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let metadata = Arc::new(
            SqliteStore::new(temp_dir.path().join("upstream.db"), 10)
                .await
                .expect("Failed to create upstream metadata store"),
        );
        let objects = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("objects"))
                .await
                .expect("Failed to create upstream object store"),
        );
        Self {
            remote: Remote::new(name, metadata, objects),
            _temp_dir: temp_dir,
        }
    }

    /// Store an object upstream and register its metadata both upstream
    /// and in the local environment.
    pub async fn add_object(&self, env: &TestEnv, seed: &str, size: u64) -> ObjectId {
        let id = self.add_unregistered(seed, size).await;
        env.register(seed, size).await;
        id
    }

    /// Store an object upstream without any local metadata.
    pub async fn add_unregistered(&self, seed: &str, size: u64) -> ObjectId {
        let id = oid(seed);
        self.remote
            .objects
            .put_object(&id, payload(seed, size as usize))
            .await
            .expect("Failed to store upstream object");
        self.remote
            .metadata
            .upsert_objects(&[meta(seed, size)])
            .await
            .expect("Failed to register upstream object");
        id
    }
}

pub fn oid(seed: &str) -> ObjectId {
    ObjectId::from_content(seed.as_bytes())
}

pub fn meta(seed: &str, size: u64) -> ObjectMeta {
    ObjectMeta::snapshot(oid(seed), "test", size)
}

/// `size` bytes derived from `seed`.
pub fn payload(seed: &str, size: usize) -> Bytes {
    Bytes::from(seed.bytes().cycle().take(size).collect::<Vec<u8>>())
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
