//! Release handles for claimed objects.

use crate::error::CacheResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use strata_core::ObjectId;
use strata_metadata::{CacheTransaction, MetadataStore};

/// Time spent in each stage of `ensure_objects`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StageTimings {
    pub filter: Duration,
    pub claim: Duration,
    pub plan: Duration,
    pub fetch: Duration,
}

/// Objects made available by `ensure_objects`.
///
/// The objects stay pinned in the cache until [`release`](Self::release) is
/// called. Releasing twice is a no-op. A lease dropped without being
/// released releases itself on the current tokio runtime and logs a warning.
pub struct ObjectLease {
    metadata: Arc<dyn MetadataStore>,
    /// Objects whose refcount this lease holds. Objects that are local but
    /// not tracked by the cache are never claimed.
    claimed: Vec<ObjectId>,
    objects: Vec<ObjectId>,
    released: AtomicBool,
    timings: StageTimings,
    acquired_at: Instant,
}

impl ObjectLease {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataStore>,
        claimed: Vec<ObjectId>,
        objects: Vec<ObjectId>,
        timings: StageTimings,
    ) -> Self {
        Self {
            metadata,
            claimed,
            objects,
            released: AtomicBool::new(false),
            timings,
            acquired_at: Instant::now(),
        }
    }

    /// The required objects, in table order.
    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn claimed(&self) -> &[ObjectId] {
        &self.claimed
    }

    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Decrement the refcount of every claimed object.
    pub async fn release(&self) -> CacheResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = release_objects(self.metadata.as_ref(), &self.claimed).await {
            // Leave the lease releasable so a retry or the drop guard can
            // still return the refcounts.
            self.released.store(false, Ordering::Release);
            return Err(e);
        }

        tracing::info!(
            objects = self.objects.len(),
            claimed = self.claimed.len(),
            filter_ms = self.timings.filter.as_millis() as u64,
            claim_ms = self.timings.claim.as_millis() as u64,
            plan_ms = self.timings.plan.as_millis() as u64,
            fetch_ms = self.timings.fetch.as_millis() as u64,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released objects"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ObjectLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLease")
            .field("objects", &self.objects.len())
            .field("claimed", &self.claimed.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for ObjectLease {
    fn drop(&mut self) {
        if self.is_released() || self.claimed.is_empty() {
            return;
        }

        let claimed = std::mem::take(&mut self.claimed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    claimed = claimed.len(),
                    "Object lease dropped without release, releasing in background"
                );
                let metadata = self.metadata.clone();
                handle.spawn(async move {
                    if let Err(e) = release_objects(metadata.as_ref(), &claimed).await {
                        tracing::error!(
                            claimed = claimed.len(),
                            error = %e,
                            "Failed to release dropped object lease"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    claimed = claimed.len(),
                    "Object lease dropped outside a runtime; refcounts leak until cleanup"
                );
            }
        }
    }
}

/// Decrement refcounts in a transaction of its own.
pub(crate) async fn release_objects(
    metadata: &dyn MetadataStore,
    ids: &[ObjectId],
) -> CacheResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut tx = metadata.begin_cache_transaction().await?;
    tx.release(ids).await?;
    tx.commit().await?;
    tracing::debug!(count = ids.len(), "Released object refcounts");
    Ok(())
}
