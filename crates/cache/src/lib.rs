//! Size-bounded object cache for strata table versions.
//!
//! [`ObjectCacheManager`] makes the objects backing a table version available
//! in the local object store:
//! - Objects in use are pinned by refcounts and never evicted
//! - Concurrent managers sharing a metadata store fetch each object once
//! - Unreferenced objects are evicted by recency and size when space is needed
//! - Objects can be pushed to and pulled from external locations through
//!   named handlers, or copied directly from a peer store

pub mod error;
pub mod eviction;
pub mod filter;
pub mod handlers;
pub mod lease;
pub mod manager;
pub mod transfer;

pub use error::{CacheError, CacheResult};
pub use eviction::{Candidate, EvictionPlan, plan_eviction};
pub use filter::{FragmentFilter, IndexFragmentFilter};
pub use handlers::{
    ExternalObjectHandler, FILE_HANDLER, FileHandler, HTTP_HANDLER, HandlerRegistry, HttpHandler,
};
pub use lease::{ObjectLease, StageTimings};
pub use manager::{EnsureRequest, EvictionStats, ObjectCacheManager};
pub use transfer::Remote;
