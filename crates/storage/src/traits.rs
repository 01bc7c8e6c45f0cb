//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use strata_core::ObjectId;

/// Key prefix under which every data object is stored.
pub const OBJECT_PREFIX: &str = "objects";

/// Object store abstraction for content-addressed object bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<StoredObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Missing objects yield `NotFound`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Static identifier of the backend type, used in log fields.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and properly configured.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct StoredObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Object-id addressed helpers over any [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    async fn has_object(&self, id: &ObjectId) -> StorageResult<bool> {
        self.exists(&id.to_object_key()).await
    }

    /// Physical size of an object, or `None` if it is not stored.
    async fn object_size(&self, id: &ObjectId) -> StorageResult<Option<u64>> {
        match self.head(&id.to_object_key()).await {
            Ok(meta) => Ok(Some(meta.size)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_object(&self, id: &ObjectId) -> StorageResult<Bytes> {
        self.get(&id.to_object_key()).await
    }

    async fn put_object(&self, id: &ObjectId, data: Bytes) -> StorageResult<()> {
        self.put(&id.to_object_key(), data).await
    }

    /// Delete an object, treating an already-missing object as deleted.
    /// Returns whether bytes were actually removed.
    async fn delete_object(&self, id: &ObjectId) -> StorageResult<bool> {
        match self.delete(&id.to_object_key()).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every stored object id. Keys under the prefix that are not valid
    /// object ids are skipped.
    async fn list_object_ids(&self) -> StorageResult<Vec<ObjectId>> {
        let mut ids: Vec<ObjectId> = self
            .list(OBJECT_PREFIX)
            .await?
            .iter()
            .filter_map(|key| {
                let name = key
                    .strip_prefix(OBJECT_PREFIX)?
                    .trim_start_matches(['/', '\\']);
                ObjectId::new(name).ok()
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreExt for T {}
