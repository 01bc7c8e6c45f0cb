//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Object cache configuration.
///
/// Passed explicitly to the cache manager; there is no process-wide default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total size of ready cached objects, in bytes.
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    /// Per-second decay applied to an entry's score since its last use.
    #[serde(default = "default_eviction_decay")]
    pub eviction_decay: f64,
    /// Size below which every object is scored as if it had this size.
    #[serde(default = "default_eviction_floor_bytes")]
    pub eviction_floor_bytes: u64,
    /// Minimum fraction of capacity freed by one eviction pass.
    #[serde(default = "default_eviction_min_fraction")]
    pub eviction_min_fraction: f64,
}

fn default_capacity_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_eviction_decay() -> f64 {
    0.002
}

fn default_eviction_floor_bytes() -> u64 {
    1024 * 1024
}

fn default_eviction_min_fraction() -> f64 {
    0.05
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            eviction_decay: default_eviction_decay(),
            eviction_floor_bytes: default_eviction_floor_bytes(),
            eviction_min_fraction: default_eviction_min_fraction(),
        }
    }
}

impl CacheConfig {
    /// Configuration with the given capacity and default eviction tuning.
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            ..Self::default()
        }
    }

    /// Validate cache configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity_bytes == 0 {
            return Err("cache.capacity_bytes must be greater than 0".to_string());
        }
        if !self.eviction_decay.is_finite() || self.eviction_decay < 0.0 {
            return Err(format!(
                "cache.eviction_decay must be a non-negative number, got {}",
                self.eviction_decay
            ));
        }
        if !(0.0..=1.0).contains(&self.eviction_min_fraction) {
            return Err(format!(
                "cache.eviction_min_fraction must be between 0 and 1, got {}",
                self.eviction_min_fraction
            ));
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/objects"),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database shared by every cache manager on this host.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a connection waits for another process's write lock.
        ///
        /// A cache transaction holds the write lock for its whole fetch,
        /// downloads included, so this must cover the slowest expected
        /// download. A manager that waits longer fails with a busy error.
        #[serde(default = "default_sqlite_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer STRATA_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_sqlite_busy_timeout_secs() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            busy_timeout_secs: default_sqlite_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Filesystem handler: copies objects into a shared directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileHandlerConfig {
    pub path: PathBuf,
}

/// HTTP handler: PUTs objects to and GETs them from a web server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpHandlerConfig {
    /// Objects are stored at `<base_url>/<object_id>`.
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    300
}

/// External object handler configuration. Each present section registers
/// one handler.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HandlersConfig {
    #[serde(default)]
    pub file: Option<FileHandlerConfig>,
    #[serde(default)]
    pub http: Option<HttpHandlerConfig>,
}

impl HandlersConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(http) = &self.http {
            if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://")) {
                return Err(format!(
                    "handlers.http.base_url must be an http(s) URL, got {}",
                    http.base_url
                ));
            }
            if http.password.is_some() && http.username.is_none() {
                return Err("handlers.http.password requires handlers.http.username".to_string());
            }
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub handlers: HandlersConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            cache: CacheConfig::default(),
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                busy_timeout_secs: default_sqlite_busy_timeout_secs(),
            },
            storage: StorageConfig::Filesystem {
                path: dir.join("objects"),
            },
            handlers: HandlersConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        self.metadata.validate()?;
        self.handlers.validate()
    }
}
