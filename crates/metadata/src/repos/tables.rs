//! Table version repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use strata_core::TableVersion;

/// Repository for table versions. Their object lists form the live set
/// used by cleanup.
#[async_trait]
pub trait TableRepo: Send + Sync {
    /// Insert or replace a table version.
    async fn upsert_table(&self, table: &TableVersion) -> MetadataResult<()>;

    /// Get a table version.
    async fn get_table(
        &self,
        namespace: &str,
        repository: &str,
        image_hash: &str,
        table_name: &str,
    ) -> MetadataResult<Option<TableVersion>>;

    /// Delete a table version. Returns whether a row was removed.
    async fn delete_table(
        &self,
        namespace: &str,
        repository: &str,
        image_hash: &str,
        table_name: &str,
    ) -> MetadataResult<bool>;

    /// List every table version.
    async fn list_tables(&self) -> MetadataResult<Vec<TableVersion>>;
}
