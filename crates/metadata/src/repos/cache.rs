//! Object cache status, occupancy and the cache transaction handle.

use crate::error::MetadataResult;
use crate::models::{CacheEntryRow, EvictionCandidateRow};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use strata_core::{ObjectId, ObjectLocation};
use time::OffsetDateTime;

/// Read-only view of the cache status table outside any transaction.
#[async_trait]
pub trait CacheStatusRepo: Send + Sync {
    /// Cache entries for the given objects, ordered by object id.
    async fn get_cache_entries(&self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Every cache entry, ordered by object id.
    async fn list_cache_entries(&self) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Current value of the occupancy counter, in bytes.
    async fn get_cache_occupancy(&self) -> MetadataResult<i64>;
}

/// One transaction against the cache tables.
///
/// Every step of the cache protocol runs on a single handle and ends with
/// `commit` or `rollback`. Dropping an uncommitted handle rolls it back.
/// Handles take the backend's write lock when they are opened (SQLite) or
/// lock rows in ascending object-id order (PostgreSQL), so concurrent cache
/// managers never acquire the same rows in opposite orders.
///
/// Id slices passed in may be in any order and contain duplicates.
#[async_trait]
pub trait CacheTransaction: Send {
    /// Take the table-level exclusive lock on the cache status table.
    async fn lock_cache_status(&mut self) -> MetadataResult<()>;

    /// Bump refcount and `last_used` on existing entries. Returns the ids
    /// that had an entry.
    async fn bump_refcounts(
        &mut self,
        ids: &[ObjectId],
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<ObjectId>>;

    /// Insert a pending entry (`ready = false`, `refcount = 1`). If an entry
    /// was inserted concurrently, its refcount is incremented instead.
    async fn insert_claim(&mut self, id: &ObjectId, now: OffsetDateTime) -> MetadataResult<()>;

    /// Pin an object for upload: insert a pending entry, or increment the
    /// refcount of an existing one without touching its ready flag.
    /// Returns `true` if a new entry was inserted.
    async fn pin_for_upload(&mut self, id: &ObjectId, now: OffsetDateTime) -> MetadataResult<bool>;

    /// Ids among `ids` whose entry is not ready, sorted. With `lock_rows`,
    /// the rows stay locked until the transaction ends.
    async fn not_ready(&mut self, ids: &[ObjectId], lock_rows: bool)
    -> MetadataResult<Vec<ObjectId>>;

    /// Lock and return the entries for `ids`, in ascending id order.
    async fn lock_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Entries for `ids` without locking, ordered by object id.
    async fn cache_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>>;

    async fn set_ready(&mut self, ids: &[ObjectId], ready: bool) -> MetadataResult<()>;

    /// Decrement refcounts. Never goes below zero.
    async fn release(&mut self, ids: &[ObjectId]) -> MetadataResult<()>;

    /// Delete entries. Returns the number of rows removed.
    async fn delete_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<u64>;

    /// Every zero-refcount entry with its metadata size.
    async fn eviction_candidates(&mut self) -> MetadataResult<Vec<EvictionCandidateRow>>;

    /// Ids of every ready entry, sorted.
    async fn ready_entries(&mut self) -> MetadataResult<Vec<ObjectId>>;

    async fn occupancy(&mut self) -> MetadataResult<i64>;

    async fn adjust_occupancy(&mut self, delta: i64) -> MetadataResult<()>;

    async fn set_occupancy(&mut self, total: i64) -> MetadataResult<()>;

    /// Metadata sizes of the given objects. Objects without metadata are
    /// absent from the result.
    async fn object_sizes(&mut self, ids: &[ObjectId]) -> MetadataResult<HashMap<ObjectId, u64>>;

    async fn external_locations(&mut self, ids: &[ObjectId])
    -> MetadataResult<Vec<ObjectLocation>>;

    async fn register_locations(&mut self, locations: &[ObjectLocation]) -> MetadataResult<()>;

    /// Union of object ids referenced by any table row.
    async fn referenced_object_ids(&mut self) -> MetadataResult<BTreeSet<ObjectId>>;

    /// Union of object ids with metadata, a location or a cache entry.
    async fn known_object_ids(&mut self) -> MetadataResult<BTreeSet<ObjectId>>;

    /// Delete metadata and location rows for `ids`, and their cache entries
    /// when `include_cache_status` is set. Returns rows removed.
    async fn purge_metadata(
        &mut self,
        ids: &[ObjectId],
        include_cache_status: bool,
    ) -> MetadataResult<u64>;

    async fn commit(self: Box<Self>) -> MetadataResult<()>;

    async fn rollback(self: Box<Self>) -> MetadataResult<()>;
}

/// Sorted, de-duplicated copy of `ids`.
pub fn sorted_unique(ids: &[ObjectId]) -> Vec<ObjectId> {
    let set: BTreeSet<&ObjectId> = ids.iter().collect();
    set.into_iter().cloned().collect()
}
