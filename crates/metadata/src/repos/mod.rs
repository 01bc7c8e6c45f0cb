//! Repository traits for metadata operations.

pub mod cache;
pub mod locations;
pub mod objects;
pub mod tables;

pub use cache::{CacheStatusRepo, CacheTransaction};
pub use locations::LocationRepo;
pub use objects::ObjectRepo;
pub use tables::TableRepo;
