//! External object handlers.
//!
//! A handler moves object bytes between the local object store and some
//! location outside it, identified by a URL. Handlers are looked up by name;
//! the name is also the `protocol` recorded with each registered location.

mod file;
mod http;

pub use file::FileHandler;
pub use http::HttpHandler;

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::config::HandlersConfig;
use strata_core::{ObjectId, PEER_HANDLER};
use strata_storage::ObjectStore;

/// Name of the filesystem handler.
pub const FILE_HANDLER: &str = "FILE";
/// Name of the HTTP handler.
pub const HTTP_HANDLER: &str = "HTTP";

/// Transfers objects to and from an external location.
#[async_trait]
pub trait ExternalObjectHandler: Send + Sync {
    /// Upload the given objects from `source` and return one URL per
    /// object, in input order.
    async fn upload_objects(
        &self,
        ids: &[ObjectId],
        source: &dyn ObjectStore,
    ) -> CacheResult<Vec<String>>;

    /// Download `(object_id, url)` pairs into `target`.
    async fn download_objects(
        &self,
        objects: &[(ObjectId, String)],
        target: &dyn ObjectStore,
    ) -> CacheResult<()>;
}

/// Handlers available to a cache manager, by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ExternalObjectHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with one handler per configured section.
    pub fn from_config(config: &HandlersConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;

        let mut registry = Self::new();
        if let Some(file) = &config.file {
            registry.register(FILE_HANDLER, Arc::new(FileHandler::new(&file.path)))?;
        }
        if let Some(http) = &config.http {
            registry.register(HTTP_HANDLER, Arc::new(HttpHandler::from_config(http)?))?;
        }
        Ok(registry)
    }

    /// Register a handler, replacing any handler with the same name. The
    /// peer transfer name is reserved.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ExternalObjectHandler>,
    ) -> CacheResult<()> {
        let name = name.into();
        if name == PEER_HANDLER {
            return Err(CacheError::Config(format!(
                "handler name {PEER_HANDLER} is reserved for peer transfer"
            )));
        }
        tracing::debug!(handler = %name, "Registered external object handler");
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> CacheResult<Arc<dyn ExternalObjectHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownHandler(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::config::FileHandlerConfig;

    #[test]
    fn test_peer_handler_name_is_reserved() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(PEER_HANDLER, Arc::new(FileHandler::new("/tmp/x")))
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
        assert!(matches!(
            registry.get(PEER_HANDLER),
            Err(CacheError::UnknownHandler(_))
        ));
    }

    #[test]
    fn test_from_config_registers_configured_handlers() {
        let config = HandlersConfig {
            file: Some(FileHandlerConfig {
                path: "/tmp/strata-external".into(),
            }),
            http: None,
        };
        let registry = HandlerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec![FILE_HANDLER]);
        assert!(registry.contains(FILE_HANDLER));
        assert!(!registry.contains(HTTP_HANDLER));
    }
}
