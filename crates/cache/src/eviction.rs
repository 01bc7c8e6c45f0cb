//! Eviction planning.
//!
//! Planning is a pure function over the zero-refcount entries so the policy
//! can be tested without a database. The manager applies the plan inside the
//! transaction that holds the cache status lock.

use crate::error::{CacheError, CacheResult};
use strata_core::ObjectId;
use strata_core::config::CacheConfig;
use time::OffsetDateTime;

/// A zero-refcount cache entry that may be evicted.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub object_id: ObjectId,
    /// Accounted size in bytes. Zero for entries that never became ready.
    pub size: u64,
    pub last_used: OffsetDateTime,
    /// Entry without object metadata, or one that never became ready.
    /// Orphans are removed before any scored candidate.
    pub orphan: bool,
    pub ready: bool,
}

/// Entries chosen for eviction, orphans first.
#[derive(Debug, Default)]
pub struct EvictionPlan {
    pub victims: Vec<Candidate>,
    pub orphans: usize,
    /// Bytes reclaimed once every victim is gone.
    pub freed: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.victims.iter().map(|c| c.object_id.clone()).collect()
    }

    /// Bytes to subtract from the occupancy counter. Only ready entries were
    /// ever counted.
    pub fn occupancy_released(&self) -> u64 {
        self.victims.iter().filter(|c| c.ready).map(|c| c.size).sum()
    }

    fn push(&mut self, candidate: Candidate) {
        self.freed += candidate.size;
        self.victims.push(candidate);
    }
}

/// Eviction score; lower is evicted first.
///
/// Reuse likelihood decays exponentially with time since last use, and the
/// cost of re-fetching never drops below that of a `floor`-sized object.
pub fn score(candidate: &Candidate, config: &CacheConfig, now: OffsetDateTime) -> f64 {
    let idle_secs = (now - candidate.last_used).as_seconds_f64().max(0.0);
    let cost = candidate.size.max(config.eviction_floor_bytes) as f64;
    (-config.eviction_decay * idle_secs).exp() * cost
}

/// Choose which entries to evict.
///
/// With `required = None` every candidate is evicted. Otherwise orphans go
/// first, then candidates in ascending score order until at least
/// `max(required, min_fraction * capacity)` bytes are freed. Fails with
/// [`CacheError::Capacity`] when all candidates together hold less than
/// `required` bytes.
pub fn plan_eviction(
    candidates: Vec<Candidate>,
    required: Option<u64>,
    config: &CacheConfig,
    now: OffsetDateTime,
) -> CacheResult<EvictionPlan> {
    let (orphans, scored): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.orphan);

    let mut plan = EvictionPlan {
        orphans: orphans.len(),
        ..EvictionPlan::default()
    };
    for orphan in orphans {
        plan.push(orphan);
    }

    let Some(required) = required else {
        for candidate in scored {
            plan.push(candidate);
        }
        return Ok(plan);
    };

    let reclaimable = plan.freed + scored.iter().map(|c| c.size).sum::<u64>();
    if reclaimable < required {
        return Err(CacheError::Capacity {
            required,
            available: reclaimable,
        });
    }

    let headroom = (config.eviction_min_fraction * config.capacity_bytes as f64) as u64;
    let target = required.max(headroom);

    let mut scored: Vec<(f64, Candidate)> = scored
        .into_iter()
        .map(|c| (score(&c, config, now), c))
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| {
        a_score
            .total_cmp(b_score)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });

    for (_, candidate) in scored {
        if plan.freed >= target {
            break;
        }
        plan.push(candidate);
    }

    Ok(plan)
}
