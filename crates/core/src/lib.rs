//! Core domain types and shared logic for the strata object cache.
//!
//! This crate defines the data model used across all other crates:
//! - Content-addressed object identifiers and object metadata
//! - Table versions and their column schemas
//! - Filter predicates (quals) used to narrow fragment sets
//! - Configuration for the cache, metadata store, storage and handlers

pub mod config;
pub mod error;
pub mod object;
pub mod qual;
pub mod size;
pub mod table;

pub use error::{Error, Result};
pub use object::{ColumnRange, ObjectFormat, ObjectId, ObjectIndex, ObjectLocation, ObjectMeta};
pub use qual::{Qual, QualOp, Quals};
pub use size::pretty_size;
pub use table::{TableColumn, TableVersion};

/// Name of the built-in handler that transfers objects directly between
/// two metadata stores without registering an external location.
pub const PEER_HANDLER: &str = "DB";

/// Maximum number of physical objects deleted per batch.
pub const DELETE_BATCH_SIZE: usize = 100;
