//! External location registry.

use crate::error::MetadataResult;
use async_trait::async_trait;
use strata_core::{ObjectId, ObjectLocation};

/// Repository for external object locations.
#[async_trait]
pub trait LocationRepo: Send + Sync {
    /// Register locations, replacing any existing location for the same
    /// (object, protocol) pair.
    async fn register_object_locations(&self, locations: &[ObjectLocation]) -> MetadataResult<()>;

    /// Registered locations for the given objects, ordered by object id.
    async fn get_external_object_locations(
        &self,
        ids: &[ObjectId],
    ) -> MetadataResult<Vec<ObjectLocation>>;
}
