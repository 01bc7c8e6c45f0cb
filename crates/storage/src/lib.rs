//! Physical object storage for the strata object cache.
//!
//! Every data object is stored under `objects/<object_id>`. Bytes are only
//! ever written atomically, so a key that exists always holds a complete
//! object.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{OBJECT_PREFIX, ObjectStore, ObjectStoreExt, StoredObjectMeta};

use std::sync::Arc;
use strata_core::config::StorageConfig;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            if path.as_os_str().is_empty() {
                return Err(StorageError::Config(
                    "filesystem storage path cannot be empty".to_string(),
                ));
            }
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
