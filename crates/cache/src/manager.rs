//! The object cache manager.
//!
//! Several managers, possibly in different processes, share one metadata
//! store and one local object store. The cache status table is their only
//! coordination channel: every refcount change, ready transition and
//! eviction happens inside a cache transaction, and transactions touching
//! several entries lock them in ascending object-id order.

use crate::error::{CacheError, CacheResult};
use crate::eviction::{Candidate, plan_eviction};
use crate::filter::{FragmentFilter, IndexFragmentFilter};
use crate::handlers::HandlerRegistry;
use crate::lease::{ObjectLease, StageTimings, release_objects};
use crate::transfer::{Remote, locations_for};
use futures::future::{join_all, try_join_all};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use strata_core::config::CacheConfig;
use strata_core::{
    DELETE_BATCH_SIZE, ObjectId, ObjectLocation, Quals, TableVersion, pretty_size,
};
use strata_metadata::models::{size_from_db, size_to_db};
use strata_metadata::repos::cache::sorted_unique;
use strata_metadata::{
    CacheStatusRepo, CacheTransaction, LocationRepo, MetadataStore, ObjectRepo,
};
use strata_storage::{ObjectStore, ObjectStoreExt};
use time::OffsetDateTime;

/// Objects to make available locally.
#[derive(Clone, Debug)]
pub struct EnsureRequest<'a> {
    pub table: &'a TableVersion,
    /// Explicit object list, taken as is; defaults to the table's objects.
    pub objects: Option<Vec<ObjectId>>,
    /// Narrows the table's objects; ignored when `objects` is set.
    pub quals: Option<Quals>,
    /// Peer to copy objects from when they have no external location.
    pub upstream: Option<&'a Remote>,
}

impl<'a> EnsureRequest<'a> {
    pub fn new(table: &'a TableVersion) -> Self {
        Self {
            table,
            objects: None,
            quals: None,
            upstream: None,
        }
    }

    pub fn objects(mut self, objects: Vec<ObjectId>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn quals(mut self, quals: Quals) -> Self {
        self.quals = Some(quals);
        self
    }

    pub fn upstream(mut self, remote: &'a Remote) -> Self {
        self.upstream = Some(remote);
        self
    }
}

/// Outcome of one eviction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub evicted: usize,
    pub orphans: usize,
    pub bytes_freed: u64,
    /// Objects whose bytes could not be removed from storage. Their entries
    /// are gone; cleanup removes the bytes later.
    pub delete_failures: usize,
}

struct PhysicalDeletion {
    deleted: Vec<ObjectId>,
    failures: usize,
}

/// Keeps the set of objects a table version needs available locally,
/// within a fixed byte budget.
pub struct ObjectCacheManager {
    pub(crate) config: CacheConfig,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) handlers: HandlerRegistry,
    filter: Arc<dyn FragmentFilter>,
}

impl ObjectCacheManager {
    pub fn new(
        config: CacheConfig,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        let filter = Arc::new(IndexFragmentFilter::new(metadata.clone()));
        Ok(Self {
            config,
            metadata,
            objects,
            handlers: HandlerRegistry::default(),
            filter,
        })
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_fragment_filter(mut self, filter: Arc<dyn FragmentFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    // =========================================================================
    // Ensure
    // =========================================================================

    /// Make every required object of a table version ready locally.
    ///
    /// Returns a lease that pins the objects until it is released. On error
    /// nothing stays pinned by this call.
    pub async fn ensure_objects(&self, request: EnsureRequest<'_>) -> CacheResult<ObjectLease> {
        let table = request.table.display_name();
        let mut timings = StageTimings::default();

        let stage = Instant::now();
        let required = self.resolve_objects(&request).await?;
        timings.filter = stage.elapsed();

        if required.is_empty() {
            return Ok(ObjectLease::new(
                self.metadata.clone(),
                Vec::new(),
                Vec::new(),
                timings,
            ));
        }

        let stage = Instant::now();
        let claimed = self.claim_objects(&required).await?;
        timings.claim = stage.elapsed();

        let stage = Instant::now();
        if let Err(e) = self.prepare_fetch_list(&required).await {
            tracing::warn!(
                table = %table,
                code = e.code(),
                error = %e,
                "Fetch planning failed, dropping claims"
            );
            self.abandon_claims(&required, &claimed).await;
            return Err(e);
        }
        timings.plan = stage.elapsed();

        let stage = Instant::now();
        if let Err(e) = self
            .fetch_objects(&table, &required, &claimed, request.upstream)
            .await
        {
            // Integrity failures release their claims in the fetch
            // transaction itself.
            if !matches!(e, CacheError::Integrity { .. })
                && let Err(release_err) = release_objects(self.metadata.as_ref(), &claimed).await
            {
                tracing::error!(
                    table = %table,
                    claimed = claimed.len(),
                    error = %release_err,
                    "Failed to release claims after fetch failure"
                );
            }
            return Err(e);
        }
        timings.fetch = stage.elapsed();

        tracing::info!(
            table = %table,
            objects = required.len(),
            claimed = claimed.len(),
            "Objects ready"
        );
        Ok(ObjectLease::new(
            self.metadata.clone(),
            claimed,
            required,
            timings,
        ))
    }

    /// Scoped form of [`ensure_objects`](Self::ensure_objects): the lease is
    /// released once `f` completes.
    pub async fn with_objects<F, Fut, T>(&self, request: EnsureRequest<'_>, f: F) -> CacheResult<T>
    where
        F: FnOnce(Vec<ObjectId>) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.ensure_objects(request).await?;
        let output = f(lease.objects().to_vec()).await;
        lease.release().await?;
        Ok(output)
    }

    async fn resolve_objects(&self, request: &EnsureRequest<'_>) -> CacheResult<Vec<ObjectId>> {
        let explicit = request.objects.is_some();
        let objects = request
            .objects
            .clone()
            .unwrap_or_else(|| request.table.objects.clone());
        let mut seen = HashSet::new();
        let objects: Vec<ObjectId> = objects
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        match &request.quals {
            Some(quals) if !explicit && !quals.is_empty() => {
                self.filter
                    .filter_fragments(&objects, quals, &request.table.schema)
                    .await
            }
            _ => Ok(objects),
        }
    }

    /// Take a reference on every required object the cache tracks, creating
    /// pending entries for objects it has never seen. Returns the claimed
    /// ids, sorted.
    async fn claim_objects(&self, required: &[ObjectId]) -> CacheResult<Vec<ObjectId>> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.metadata.begin_cache_transaction().await?;

        let bumped = tx.bump_refcounts(required, now).await?;
        let bumped_set: HashSet<&ObjectId> = bumped.iter().collect();

        let mut inserted = Vec::new();
        for id in sorted_unique(required) {
            if bumped_set.contains(&id) {
                continue;
            }
            if self.objects.has_object(&id).await? {
                tracing::debug!(object_id = %id, "Object stored outside the cache, not claiming");
                continue;
            }
            tx.insert_claim(&id, now).await?;
            inserted.push(id);
        }
        tx.commit().await?;

        tracing::debug!(
            bumped = bumped.len(),
            inserted = inserted.len(),
            "Claimed objects"
        );

        let mut claimed = bumped;
        claimed.extend(inserted);
        claimed.sort();
        claimed.dedup();
        Ok(claimed)
    }

    /// Make room for every required object that is not ready yet, evicting
    /// under the cache status lock if needed.
    async fn prepare_fetch_list(&self, required: &[ObjectId]) -> CacheResult<()> {
        let mut tx = self.metadata.begin_cache_transaction().await?;
        if tx.not_ready(required, false).await?.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        tx.lock_cache_status().await?;
        // Another manager may have fetched or evicted since the first look.
        let pending = tx.not_ready(required, false).await?;
        if pending.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        let needed: u64 = self
            .accounted_sizes(tx.as_mut(), &pending)
            .await?
            .values()
            .sum();
        let capacity = self.config.capacity_bytes;
        if needed > capacity {
            return Err(CacheError::Capacity {
                required: needed,
                available: capacity,
            });
        }

        let occupancy = size_from_db(tx.occupancy().await?);
        let free = capacity.saturating_sub(occupancy);
        if needed > free {
            let shortfall = needed - free;
            tracing::info!(
                needed = %pretty_size(needed),
                free = %pretty_size(free),
                shortfall = %pretty_size(shortfall),
                "Evicting to make room for fetch"
            );
            self.evict_within(tx.as_mut(), required, Some(shortfall))
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Download every required object that is still pending and mark it
    /// ready. The pending rows stay locked for the whole download, so each
    /// object is fetched by one manager only.
    async fn fetch_objects(
        &self,
        table: &str,
        required: &[ObjectId],
        claimed: &[ObjectId],
        upstream: Option<&Remote>,
    ) -> CacheResult<()> {
        let mut tx = self.metadata.begin_cache_transaction().await?;
        let to_fetch = tx.not_ready(required, true).await?;

        // A claimed entry can disappear under a concurrent integrity
        // failure or cleanup. Unless its bytes are here, it is missing.
        let tracked: HashSet<ObjectId> = tx
            .cache_entries(claimed)
            .await?
            .into_iter()
            .map(|e| e.object_id)
            .collect();
        let mut missing = Vec::new();
        for id in claimed {
            if !tracked.contains(id) && !self.objects.has_object(id).await? {
                missing.push(id.clone());
            }
        }

        if to_fetch.is_empty() && missing.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        if !to_fetch.is_empty() {
            let locations = tx.external_locations(&to_fetch).await?;
            tracing::info!(
                table = %table,
                count = to_fetch.len(),
                external = locations.len(),
                upstream = upstream.map(|r| r.name.as_str()).unwrap_or("<none>"),
                "Fetching objects"
            );
            if let Err(e) = self
                .download_objects(upstream, &to_fetch, &locations)
                .await
            {
                rollback_quietly(tx).await;
                return Err(e);
            }
        }

        let mut fetched = Vec::with_capacity(to_fetch.len());
        for id in to_fetch {
            if self.objects.has_object(&id).await? {
                fetched.push(id);
            } else {
                missing.push(id);
            }
        }

        if !fetched.is_empty() {
            tx.set_ready(&fetched, true).await?;
            let added: u64 = self
                .accounted_sizes(tx.as_mut(), &fetched)
                .await?
                .values()
                .sum();
            tx.adjust_occupancy(size_to_db(added)).await?;
        }

        if missing.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        missing.sort();
        tx.delete_entries(&missing).await?;
        tx.release(claimed).await?;
        tx.commit().await?;

        tracing::error!(
            table = %table,
            missing = missing.len(),
            fetched = fetched.len(),
            "Objects still missing after fetch"
        );
        Err(CacheError::Integrity {
            context: format!("fetching objects for {table}"),
            missing,
        })
    }

    /// Undo a claim that will not be followed by a fetch: drop the
    /// references and any pending entry nobody else holds.
    async fn abandon_claims(&self, required: &[ObjectId], claimed: &[ObjectId]) {
        let result: CacheResult<()> = async {
            let mut tx = self.metadata.begin_cache_transaction().await?;
            tx.release(claimed).await?;
            let stale: Vec<ObjectId> = tx
                .cache_entries(required)
                .await?
                .into_iter()
                .filter(|e| !e.ready && e.refcount == 0)
                .map(|e| e.object_id)
                .collect();
            if !stale.is_empty() {
                tx.delete_entries(&stale).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(
                claimed = claimed.len(),
                error = %e,
                "Failed to drop claims; refcounts leak until cleanup"
            );
        }
    }

    /// Accounted size of each object: its metadata size, else its physical
    /// size, else zero.
    async fn accounted_sizes(
        &self,
        tx: &mut dyn CacheTransaction,
        ids: &[ObjectId],
    ) -> CacheResult<HashMap<ObjectId, u64>> {
        let mut sizes = tx.object_sizes(ids).await?;
        for id in ids {
            if !sizes.contains_key(id) {
                let size = self.objects.object_size(id).await?.unwrap_or(0);
                sizes.insert(id.clone(), size);
            }
        }
        Ok(sizes)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict unreferenced objects.
    ///
    /// With `required = None` every unreferenced entry outside `keep` is
    /// evicted. Otherwise at least `required` bytes are freed, or
    /// [`CacheError::Capacity`] is returned and nothing changes.
    pub async fn run_eviction(
        &self,
        keep: &[ObjectId],
        required: Option<u64>,
    ) -> CacheResult<EvictionStats> {
        let mut tx = self.metadata.begin_cache_transaction().await?;
        tx.lock_cache_status().await?;
        let stats = self.evict_within(tx.as_mut(), keep, required).await?;
        tx.commit().await?;
        Ok(stats)
    }

    /// Plan and apply an eviction inside `tx`, which must hold the cache
    /// status lock. Physical bytes are deleted before the caller commits.
    async fn evict_within(
        &self,
        tx: &mut dyn CacheTransaction,
        keep: &[ObjectId],
        required: Option<u64>,
    ) -> CacheResult<EvictionStats> {
        let keep: HashSet<&ObjectId> = keep.iter().collect();

        let mut candidates = Vec::new();
        for row in tx.eviction_candidates().await? {
            if keep.contains(&row.object_id) {
                continue;
            }
            let (size, orphan) = match (row.ready, row.size_bytes) {
                (false, _) => (0, true),
                (true, Some(size)) => (size_from_db(size), false),
                (true, None) => (
                    self.objects.object_size(&row.object_id).await?.unwrap_or(0),
                    true,
                ),
            };
            candidates.push(Candidate {
                object_id: row.object_id,
                size,
                last_used: row.last_used,
                orphan,
                ready: row.ready,
            });
        }

        let plan = plan_eviction(candidates, required, &self.config, OffsetDateTime::now_utc())?;
        if plan.is_empty() {
            return Ok(EvictionStats::default());
        }

        let ids = plan.object_ids();
        tx.delete_entries(&ids).await?;
        tx.adjust_occupancy(-size_to_db(plan.occupancy_released()))
            .await?;
        let deletion = self.delete_physical(&ids).await;

        let stats = EvictionStats {
            evicted: ids.len(),
            orphans: plan.orphans,
            bytes_freed: plan.freed,
            delete_failures: deletion.failures,
        };
        tracing::info!(
            evicted = stats.evicted,
            orphans = stats.orphans,
            freed = %pretty_size(stats.bytes_freed),
            required = %required.map(pretty_size).unwrap_or_else(|| "all".to_string()),
            delete_failures = stats.delete_failures,
            "Evicted objects"
        );
        Ok(stats)
    }

    /// Delete stored bytes in bounded batches. Missing objects count as
    /// deleted; failures are logged and left for cleanup.
    async fn delete_physical(&self, ids: &[ObjectId]) -> PhysicalDeletion {
        let mut deletion = PhysicalDeletion {
            deleted: Vec::with_capacity(ids.len()),
            failures: 0,
        };
        for batch in ids.chunks(DELETE_BATCH_SIZE) {
            let results = join_all(batch.iter().map(|id| self.objects.delete_object(id))).await;
            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => deletion.deleted.push(id.clone()),
                    Ok(false) => {
                        tracing::debug!(object_id = %id, "Object already absent from storage");
                    }
                    Err(e) => {
                        deletion.failures += 1;
                        tracing::warn!(
                            object_id = %id,
                            error = %e,
                            "Failed to delete object from storage (bytes left for cleanup)"
                        );
                    }
                }
            }
        }
        deletion
    }

    // =========================================================================
    // External locations
    // =========================================================================

    /// Upload objects through a named handler and register where they went.
    ///
    /// Objects that already have an external location are skipped. Objects
    /// the cache did not track, and pending entries whose bytes were just
    /// uploaded, become ready cache entries that count against capacity.
    pub async fn make_objects_external(
        &self,
        ids: &[ObjectId],
        handler_name: &str,
    ) -> CacheResult<Vec<ObjectLocation>> {
        let handler = self.handlers.get(handler_name)?;

        let ids = sorted_unique(ids);
        let registered: HashSet<ObjectId> = self
            .metadata
            .get_external_object_locations(&ids)
            .await?
            .into_iter()
            .map(|l| l.object_id)
            .collect();
        let pending: Vec<ObjectId> = ids
            .into_iter()
            .filter(|id| !registered.contains(id))
            .collect();
        if pending.is_empty() {
            tracing::debug!(handler = handler_name, "All objects already external");
            return Ok(Vec::new());
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.metadata.begin_cache_transaction().await?;
        tx.lock_cache_status().await?;

        let mut inserted = Vec::new();
        for id in &pending {
            if tx.pin_for_upload(id, now).await? {
                inserted.push(id.clone());
            }
        }
        let entries = tx.lock_entries(&pending).await?;

        // Registered by another manager between the first check and the lock.
        let raced: HashSet<ObjectId> = tx
            .external_locations(&pending)
            .await?
            .into_iter()
            .map(|l| l.object_id)
            .collect();
        let to_upload: Vec<ObjectId> = pending
            .iter()
            .filter(|id| !raced.contains(*id))
            .cloned()
            .collect();

        tracing::info!(
            handler = handler_name,
            count = to_upload.len(),
            "Uploading objects to external location"
        );
        let locations = match handler
            .upload_objects(&to_upload, self.objects.as_ref())
            .await
            .and_then(|urls| locations_for(&to_upload, urls, handler_name))
        {
            Ok(locations) => locations,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        tx.register_locations(&locations).await?;

        // New pins and pending entries left behind by an earlier failed
        // fetch both have their bytes locally now.
        let uploaded: HashSet<&ObjectId> = to_upload.iter().chain(inserted.iter()).collect();
        let newly_ready: Vec<ObjectId> = entries
            .into_iter()
            .filter(|e| !e.ready && uploaded.contains(&e.object_id))
            .map(|e| e.object_id)
            .collect();
        if !newly_ready.is_empty() {
            tx.set_ready(&newly_ready, true).await?;
            let added: u64 = self
                .accounted_sizes(tx.as_mut(), &newly_ready)
                .await?
                .values()
                .sum();
            tx.adjust_occupancy(size_to_db(added)).await?;
        }
        tx.release(&pending).await?;
        let occupancy = size_from_db(tx.occupancy().await?);
        tx.commit().await?;

        let excess = occupancy.saturating_sub(self.config.capacity_bytes);
        if excess > 0 {
            match self.run_eviction(&[], Some(excess)).await {
                Ok(_) => {}
                Err(CacheError::Capacity { .. }) => {
                    tracing::warn!(
                        over_by = %pretty_size(excess),
                        "Cache over capacity after upload and nothing left to evict"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(locations)
    }

    pub async fn get_external_object_locations(
        &self,
        ids: &[ObjectId],
    ) -> CacheResult<Vec<ObjectLocation>> {
        Ok(self.metadata.get_external_object_locations(ids).await?)
    }

    pub async fn register_object_locations(&self, locations: &[ObjectLocation]) -> CacheResult<()> {
        Ok(self.metadata.register_object_locations(locations).await?)
    }

    // =========================================================================
    // Cleanup and introspection
    // =========================================================================

    /// Remove everything no table references.
    ///
    /// Object metadata and location rows outside the live set are always
    /// purged. With `include_physical_objects`, their cache entries and
    /// stored bytes go too and the occupancy counter is recomputed. Returns
    /// the ids whose bytes were deleted.
    pub async fn cleanup(&self, include_physical_objects: bool) -> CacheResult<Vec<ObjectId>> {
        let mut tx = self.metadata.begin_cache_transaction().await?;
        tx.lock_cache_status().await?;

        let live = tx.referenced_object_ids().await?;
        let known = tx.known_object_ids().await?;
        let garbage: Vec<ObjectId> = known.difference(&live).cloned().collect();
        let purged = tx
            .purge_metadata(&garbage, include_physical_objects)
            .await?;

        if !include_physical_objects {
            tx.commit().await?;
            tracing::info!(
                live = live.len(),
                garbage = garbage.len(),
                rows = purged,
                "Purged unreferenced object metadata"
            );
            return Ok(Vec::new());
        }

        let doomed: Vec<ObjectId> = self
            .objects
            .list_object_ids()
            .await?
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        let deletion = self.delete_physical(&doomed).await;

        let ready = tx.ready_entries().await?;
        let occupancy: u64 = self
            .accounted_sizes(tx.as_mut(), &ready)
            .await?
            .values()
            .sum();
        tx.set_occupancy(size_to_db(occupancy)).await?;
        tx.commit().await?;

        tracing::info!(
            live = live.len(),
            garbage = garbage.len(),
            rows = purged,
            deleted = deletion.deleted.len(),
            delete_failures = deletion.failures,
            occupancy = %pretty_size(occupancy),
            "Cleaned up unreferenced objects"
        );
        Ok(deletion.deleted)
    }

    /// Delete stored objects. Cache entries are not touched. Returns the ids
    /// whose bytes were actually removed.
    pub async fn delete_objects(&self, ids: &[ObjectId]) -> CacheResult<Vec<ObjectId>> {
        let mut deleted = Vec::new();
        for batch in ids.chunks(DELETE_BATCH_SIZE) {
            let results =
                try_join_all(batch.iter().map(|id| self.objects.delete_object(id))).await?;
            deleted.extend(
                batch
                    .iter()
                    .zip(results)
                    .filter(|(_, removed)| *removed)
                    .map(|(id, _)| id.clone()),
            );
        }
        tracing::debug!(requested = ids.len(), deleted = deleted.len(), "Deleted objects");
        Ok(deleted)
    }

    /// Value of the occupancy counter.
    pub async fn get_cache_occupancy(&self) -> CacheResult<u64> {
        Ok(size_from_db(self.metadata.get_cache_occupancy().await?))
    }

    /// Recompute occupancy from the ready entries. Slow; used to audit the
    /// counter.
    pub async fn recalculate_cache_occupancy(&self) -> CacheResult<u64> {
        let ready: Vec<ObjectId> = self
            .metadata
            .list_cache_entries()
            .await?
            .into_iter()
            .filter(|e| e.ready)
            .map(|e| e.object_id)
            .collect();
        let metas = self.metadata.get_object_meta(&ready).await?;

        let mut total = 0;
        for id in &ready {
            total += match metas.get(id) {
                Some(meta) => meta.size_bytes,
                None => self.objects.object_size(id).await?.unwrap_or(0),
            };
        }
        Ok(total)
    }

    /// Objects present in local storage, optionally restricted to `limit_to`.
    pub async fn get_downloaded_objects(
        &self,
        limit_to: Option<&[ObjectId]>,
    ) -> CacheResult<Vec<ObjectId>> {
        let stored = self.objects.list_object_ids().await?;
        Ok(match limit_to {
            Some(limit) => {
                let limit: HashSet<&ObjectId> = limit.iter().collect();
                stored.into_iter().filter(|id| limit.contains(id)).collect()
            }
            None => stored,
        })
    }

    /// Total physical size of every stored object.
    pub async fn get_total_object_size(&self) -> CacheResult<u64> {
        let mut total = 0;
        for id in self.objects.list_object_ids().await? {
            total += self.objects.object_size(&id).await?.unwrap_or(0);
        }
        Ok(total)
    }
}

async fn rollback_quietly(tx: Box<dyn CacheTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Cache transaction rollback failed");
    }
}
