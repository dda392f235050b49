//! linkcache CLI
//!
//! Runs the cache tier against an in-memory or Redis volatile store and an
//! in-memory record store, optionally seeded from a JSON file of records.
//!
//! ```text
//! linkcache simulate --member abc123 --events 250
//! linkcache --redis-url redis://127.0.0.1/ top --scope global --limit 10 --seed links.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linkcache::adapters::{InMemoryRecordStore, InMemoryVolatileStore};
use linkcache::cache::keys::{counter_key, ranking_key};
use linkcache::{
    CacheSettings, Error, LinkService, OwnerId, RankingScope, Result, TrackedRecord,
    VolatileStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// linkcache - cache and counter tier for short links
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file (defaults apply to missing fields)
    #[arg(long, env = "LINKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL; the in-memory store is used when absent
    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// JSON array of records loaded into the record store
    #[arg(long, env = "LINKCACHE_SEED")]
    seed: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a burst of accesses for one link and print the reconciled state
    Simulate {
        /// Link identifier
        #[arg(long, default_value = "abc123")]
        member: String,

        /// Owner of the link
        #[arg(long)]
        owner: Option<String>,

        /// Number of access events
        #[arg(long, default_value = "250")]
        events: u64,
    },

    /// Print the top links of a scope
    Top {
        /// `global` or `owner:<id>`
        #[arg(long, default_value = "global")]
        scope: String,

        /// Number of links
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

/// State printed by `simulate`
#[derive(Debug, Serialize)]
struct SimulationReport {
    member: String,
    events: u64,
    durable_total: u64,
    counter: u64,
    global_score: f64,
    reconciled_total: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let settings = match &args.config {
        Some(path) => CacheSettings::from_yaml_file(path)?,
        None => CacheSettings::default(),
    };
    info!("Starting linkcache");
    info!("  Flush threshold: {}", settings.flush_threshold);
    info!("  Logical TTL: {:?}", settings.logical_ttl);

    let store = volatile_store(&args)?;
    let durable = Arc::new(match &args.seed {
        Some(path) => InMemoryRecordStore::with_records(load_seed(path)?),
        None => InMemoryRecordStore::new(),
    });
    let service = LinkService::new(store.clone(), durable.clone(), settings)?;

    match args.command {
        Command::Simulate {
            member,
            owner,
            events,
        } => {
            let owner = owner.map(OwnerId::from);
            if durable.total(&member).is_none() {
                let mut record =
                    TrackedRecord::new(member.clone(), format!("https://example.com/{}", member));
                record.owner = owner.clone();
                service.create(record).await?;
            }

            for _ in 0..events {
                service.aggregator().record_access(&member, owner.as_ref()).await;
            }
            service.drain().await;

            let report = SimulationReport {
                durable_total: durable.total(&member).unwrap_or(0),
                counter: read_counter(store.as_ref(), &member).await?,
                global_score: store
                    .zscore(&ranking_key(&RankingScope::Global), &member)
                    .await?
                    .unwrap_or(0.0),
                reconciled_total: service.reconciled_total(&member).await?.unwrap_or(0),
                member,
                events,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Top { scope, limit } => {
            let scope: RankingScope = scope.parse()?;
            let items = service.top(&scope, limit).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }

    info!(metrics = ?service.metrics(), "Done");
    service.shutdown().await;
    Ok(())
}

#[cfg(feature = "redis")]
fn volatile_store(args: &Args) -> Result<Arc<dyn VolatileStore>> {
    match &args.redis_url {
        Some(url) => Ok(Arc::new(linkcache::adapters::RedisVolatileStore::connect(url)?)),
        None => Ok(in_memory_store()),
    }
}

#[cfg(not(feature = "redis"))]
fn volatile_store(_args: &Args) -> Result<Arc<dyn VolatileStore>> {
    Ok(in_memory_store())
}

fn in_memory_store() -> Arc<dyn VolatileStore> {
    info!("Using in-memory volatile store");
    Arc::new(InMemoryVolatileStore::new())
}

fn load_seed(path: &Path) -> Result<Vec<TrackedRecord>> {
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<TrackedRecord> = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid seed file {}: {}", path.display(), e)))?;
    info!(records = records.len(), path = %path.display(), "Loaded seed records");
    Ok(records)
}

async fn read_counter(store: &dyn VolatileStore, member: &str) -> Result<u64> {
    match store.get(&counter_key(member)).await? {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| Error::Internal(format!("counter for {} is not a number: {}", member, e))),
        None => Ok(0),
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["redis=warn", "deadpool=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
