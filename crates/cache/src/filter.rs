//! Fragment filtering: narrow a table's objects to those that may contain
//! rows matching a set of quals.

use crate::error::CacheResult;
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::{ObjectId, ObjectIndex, Qual, Quals, TableColumn};
use strata_metadata::{MetadataStore, ObjectRepo};

/// Chooses the objects a filtered query has to read.
///
/// Implementations must be conservative: an object is only dropped when it
/// provably holds no matching row. The returned ids keep their input order.
#[async_trait]
pub trait FragmentFilter: Send + Sync {
    async fn filter_fragments(
        &self,
        objects: &[ObjectId],
        quals: &Quals,
        columns: &[TableColumn],
    ) -> CacheResult<Vec<ObjectId>>;
}

/// Filters objects by the per-column value ranges in their metadata index.
pub struct IndexFragmentFilter {
    metadata: Arc<dyn MetadataStore>,
}

impl IndexFragmentFilter {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl FragmentFilter for IndexFragmentFilter {
    async fn filter_fragments(
        &self,
        objects: &[ObjectId],
        quals: &Quals,
        columns: &[TableColumn],
    ) -> CacheResult<Vec<ObjectId>> {
        if quals.is_empty() || objects.is_empty() {
            return Ok(objects.to_vec());
        }

        let metas = self.metadata.get_object_meta(objects).await?;
        let kept: Vec<ObjectId> = objects
            .iter()
            .filter(|id| match metas.get(*id) {
                Some(meta) => index_may_match(&meta.index, quals, columns),
                None => true,
            })
            .cloned()
            .collect();

        tracing::debug!(
            total = objects.len(),
            kept = kept.len(),
            "Filtered fragments by index"
        );
        Ok(kept)
    }
}

/// Whether an object with this index may hold a row satisfying every group.
pub fn index_may_match(index: &ObjectIndex, quals: &Quals, columns: &[TableColumn]) -> bool {
    quals
        .groups()
        .iter()
        .all(|group| group.is_empty() || group.iter().any(|q| qual_may_match(index, q, columns)))
}

fn qual_may_match(index: &ObjectIndex, qual: &Qual, columns: &[TableColumn]) -> bool {
    if !columns.iter().any(|c| c.name == qual.column) {
        return true;
    }
    qual.may_match(index.range(&qual.column))
}
