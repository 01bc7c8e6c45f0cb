//! Maintenance CLI for the strata object cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use strata_cache::{HandlerRegistry, ObjectCacheManager};
use strata_core::config::AppConfig;
use strata_core::{ObjectId, pretty_size};
use strata_metadata::CacheStatusRepo;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stratactl")]
#[command(about = "Maintenance CLI for the strata object cache")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "STRATA_CONFIG", default_value = "strata.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache capacity, occupancy and entry counts
    Status {
        /// Recompute occupancy from the ready entries and report drift
        #[arg(long, default_value_t = false)]
        recalculate: bool,
    },
    /// Evict unreferenced objects
    Evict {
        /// Free at least this many bytes instead of evicting everything
        #[arg(long)]
        required_bytes: Option<u64>,
        /// Objects that must not be evicted
        #[arg(long = "keep", value_name = "OBJECT_ID")]
        keep: Vec<ObjectId>,
    },
    /// Remove objects no table references
    Cleanup {
        /// Only purge metadata; keep cache entries and stored bytes
        #[arg(long, default_value_t = false)]
        metadata_only: bool,
    },
    /// Upload objects through an external handler and register their locations
    MakeExternal {
        /// Handler name (FILE, HTTP)
        #[arg(long)]
        handler: String,
        #[arg(value_name = "OBJECT_ID", required = true)]
        objects: Vec<ObjectId>,
    },
    /// List the registered external locations of objects
    Locations {
        #[arg(value_name = "OBJECT_ID", required = true)]
        objects: Vec<ObjectId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&cli.config))?;
    let manager = open_manager(&config).await?;

    match cli.command {
        Commands::Status { recalculate } => status(&manager, recalculate).await,
        Commands::Evict {
            required_bytes,
            keep,
        } => {
            let stats = manager
                .run_eviction(&keep, required_bytes)
                .await
                .context("eviction failed")?;
            println!(
                "Evicted {} object(s) ({} orphaned), freed {}",
                stats.evicted,
                stats.orphans,
                pretty_size(stats.bytes_freed)
            );
            if stats.delete_failures > 0 {
                println!(
                    "{} object(s) could not be removed from storage; run cleanup to retry",
                    stats.delete_failures
                );
            }
            Ok(())
        }
        Commands::Cleanup { metadata_only } => {
            let deleted = manager
                .cleanup(!metadata_only)
                .await
                .context("cleanup failed")?;
            if metadata_only {
                println!("Purged unreferenced object metadata");
            } else {
                println!("Deleted {} unreferenced object(s)", deleted.len());
                for id in deleted {
                    println!("  {id}");
                }
            }
            Ok(())
        }
        Commands::MakeExternal { handler, objects } => {
            let locations = manager
                .make_objects_external(&objects, &handler)
                .await
                .with_context(|| format!("failed to upload objects through {handler}"))?;
            println!("Registered {} location(s)", locations.len());
            for location in locations {
                println!("  {} {}", location.object_id, location.location);
            }
            Ok(())
        }
        Commands::Locations { objects } => {
            let locations = manager.get_external_object_locations(&objects).await?;
            if locations.is_empty() {
                println!("No external locations registered");
            }
            for location in locations {
                println!(
                    "{} {} {}",
                    location.object_id, location.protocol, location.location
                );
            }
            Ok(())
        }
    }
}

/// Load configuration from an optional TOML file overridden by `STRATA_`
/// environment variables.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STRATA_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn open_manager(config: &AppConfig) -> Result<ObjectCacheManager> {
    let metadata = strata_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    let objects = strata_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    let handlers =
        HandlerRegistry::from_config(&config.handlers).context("failed to configure handlers")?;

    Ok(ObjectCacheManager::new(config.cache.clone(), metadata, objects)?.with_handlers(handlers))
}

async fn status(manager: &ObjectCacheManager, recalculate: bool) -> Result<()> {
    let capacity = manager.config().capacity_bytes;
    let occupancy = manager.get_cache_occupancy().await?;
    let entries = manager.metadata().list_cache_entries().await?;
    let ready = entries.iter().filter(|e| e.ready).count();
    let pinned = entries.iter().filter(|e| e.refcount > 0).count();
    let stored = manager.get_downloaded_objects(None).await?;
    let stored_size = manager.get_total_object_size().await?;

    println!("Capacity:   {}", pretty_size(capacity));
    println!(
        "Occupancy:  {} ({:.1}%)",
        pretty_size(occupancy),
        occupancy as f64 * 100.0 / capacity as f64
    );
    println!(
        "Entries:    {} ({} ready, {} pinned)",
        entries.len(),
        ready,
        pinned
    );
    println!(
        "Stored:     {} object(s), {}",
        stored.len(),
        pretty_size(stored_size)
    );
    let handlers = manager.handlers().names();
    if handlers.is_empty() {
        println!("Handlers:   none");
    } else {
        println!("Handlers:   {}", handlers.join(", "));
    }

    if recalculate {
        let actual = manager.recalculate_cache_occupancy().await?;
        let drift = actual as i128 - occupancy as i128;
        println!("Recounted:  {} (drift {drift:+} bytes)", pretty_size(actual));
        if drift != 0 {
            tracing::warn!(
                counter = occupancy,
                actual,
                drift = drift as i64,
                "Occupancy counter drifted; run cleanup to reset it"
            );
        }
    }
    Ok(())
}
