use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::ratelimit::RateLimiter;
use ratekeeper::store::{CounterStore, MemoryStore};

/// Inspect and administer rate limit counters in the shared store.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests and print each decision
    Check {
        identifier: String,
        category: String,
        /// Number of requests to count
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Clear the counter for an identifier
    Reset { identifier: String, category: String },
    /// Print the current count for an identifier
    Count { identifier: String, category: String },
    /// List the configured limit classes
    Classes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = RatekeeperConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let registry = config.registry().context("loading limit classes")?;
    let store = connect_store(&config).await?;
    info!(backend = store.backend(), "Counter store ready");

    let limiter = RateLimiter::with_options(store, registry, config.limiter_options());

    match cli.command {
        Command::Check {
            identifier,
            category,
            count,
        } => {
            for _ in 0..count {
                let decision = limiter.is_allowed(&identifier, &category).await?;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Reset {
            identifier,
            category,
        } => {
            limiter.reset(&identifier, &category).await?;
            println!("reset {}", limiter.store_key(&identifier, &category));
        }
        Command::Count {
            identifier,
            category,
        } => {
            let count = limiter.get_count(&identifier, &category).await?;
            println!("{}", count);
        }
        Command::Classes => {
            let registry = limiter.registry();
            for (name, class) in registry.classes() {
                let marker = if name == registry.default_class() { " (default)" } else { "" };
                println!(
                    "{}{}: {} per {}s, on store error: {:?}",
                    name,
                    marker,
                    class.requests_per_window,
                    class.window.as_secs(),
                    class.on_store_error.unwrap_or(limiter.options().failure_policy),
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "redis")]
async fn connect_store(config: &RatekeeperConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match &config.store.redis_url {
        Some(url) => {
            let store = ratekeeper::store::RedisStore::connect(url)
                .await
                .context("connecting to Redis")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No redis_url configured, counting in process memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(config: &RatekeeperConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    if config.store.redis_url.is_some() {
        warn!("redis_url is set but this build lacks the `redis` feature, counting in process memory");
    }
    Ok(Arc::new(MemoryStore::new()))
}
