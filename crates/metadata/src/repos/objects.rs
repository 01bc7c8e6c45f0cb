//! Object metadata repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::collections::HashMap;
use strata_core::{ObjectId, ObjectMeta};

/// Repository for object metadata (size, format, index).
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Insert or replace object metadata records.
    async fn upsert_objects(&self, objects: &[ObjectMeta]) -> MetadataResult<()>;

    /// Get metadata for the given objects. Unknown ids are simply absent
    /// from the result.
    async fn get_object_meta(
        &self,
        ids: &[ObjectId],
    ) -> MetadataResult<HashMap<ObjectId, ObjectMeta>>;

    /// All object ids with a metadata record, sorted.
    async fn list_object_ids(&self) -> MetadataResult<Vec<ObjectId>>;
}
