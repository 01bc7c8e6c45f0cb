//! Cache error types.

use strata_core::{ObjectId, pretty_size};
use strata_metadata::MetadataError;
use strata_storage::StorageError;
use thiserror::Error;

/// Identifiers listed in an integrity error message before truncation.
const MAX_LISTED_IDS: usize = 5;

/// Object cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Not enough space can be made for the objects being fetched. Raised
    /// before any entry is deleted.
    #[error(
        "not enough cache space: {} required, {} available",
        pretty_size(*required),
        pretty_size(*available)
    )]
    Capacity { required: u64, available: u64 },

    /// Objects that should be local are still missing after a fetch.
    #[error("{context}: {} object(s) unavailable: {}", missing.len(), format_ids(missing))]
    Integrity {
        context: String,
        missing: Vec<ObjectId>,
    },

    /// An external handler or a peer failed to move object bytes.
    #[error("{handler} transfer failed: {message}")]
    Transport { handler: String, message: String },

    #[error("unknown external object handler: {0}")]
    UnknownHandler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl CacheError {
    pub fn transport(handler: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            handler: handler.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable code, used in log fields and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity",
            Self::Integrity { .. } => "integrity",
            Self::Transport { .. } => "transport",
            Self::UnknownHandler(_) => "unknown_handler",
            Self::Config(_) => "config",
            Self::Metadata(_) => "metadata",
            Self::Storage(_) => "storage",
            Self::Core(_) => "core",
        }
    }
}

fn format_ids(ids: &[ObjectId]) -> String {
    let mut listed = ids
        .iter()
        .take(MAX_LISTED_IDS)
        .map(ObjectId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > MAX_LISTED_IDS {
        listed.push_str(&format!(" and {} more", ids.len() - MAX_LISTED_IDS));
    }
    listed
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
