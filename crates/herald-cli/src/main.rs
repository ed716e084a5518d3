//! Herald - outbox relay process.
//!
//! store / broker / executor をワイヤリングして Supervisor に渡し、
//! Ctrl-C で graceful shutdown します。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use herald_core::app::{Pipeline, PipelineBuilder, Supervisor};
use herald_core::config::HeraldConfig;
use herald_core::domain::{EmailPayload, NewOutboxEvent};
use herald_core::impls::{InMemoryBroker, InMemoryStore, LogTransport, NotificationExecutor, SqliteStore};
use herald_core::ports::{Clock, IdGenerator, OutboxStore, SystemClock, UlidGenerator};

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Transactional outbox relay with idempotent dispatch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// JSON config file. HERALD_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the producer, consumer and reaper loops until Ctrl-C
    Run {
        /// Insert this many sample notifications before starting
        #[arg(long, default_value_t = 0)]
        seed: usize,
    },
    /// Print outbox row counts per status
    Status,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config)?;

    match cli.command.unwrap_or(Commands::Run { seed: 0 }) {
        Commands::Run { seed } => run(config, seed).await,
        Commands::Status => status(&config).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HeraldConfig> {
    let config = match path {
        Some(path) => HeraldConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => HeraldConfig::from_env().context("invalid HERALD_* environment")?,
    };
    Ok(config)
}

fn init_logging(config: &HeraldConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log level {:?}", config.log_level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config: HeraldConfig, seed: usize) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config).await?;
    if seed > 0 {
        seed_notifications(&pipeline, &config.consumer.topic, seed).await?;
    }

    let supervisor = Supervisor::spawn(&pipeline);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Shutdown signal received");
        }
        _ = supervisor.stopped() => {
            warn!("Pipeline stopped on its own");
        }
    }

    let exits = supervisor.shutdown_and_join().await;
    let failed: Vec<_> = exits.iter().filter(|exit| !exit.is_clean()).collect();
    if !failed.is_empty() {
        bail!("{} task(s) ended abnormally: {failed:?}", failed.len());
    }

    let counts = pipeline.outbox().counts().await?;
    info!(
        confirmed = counts.confirmed,
        in_flight = counts.in_flight(),
        "Herald stopped"
    );
    Ok(())
}

async fn build_pipeline(config: &HeraldConfig) -> anyhow::Result<Pipeline> {
    let broker = InMemoryBroker::new(config.broker_partitions);
    let builder = PipelineBuilder::new()
        .broker_producer(Arc::new(broker.clone()))
        .broker_consumer(Arc::new(broker.consumer(&config.consumer.topic)))
        .executor(Arc::new(NotificationExecutor::new(
            config.mail.clone(),
            LogTransport,
        )))
        .config(config);

    let builder = match &config.database_path {
        Some(path) => {
            let store = SqliteStore::open(path)
                .await
                .with_context(|| format!("failed to open database at {}", path.display()))?;
            builder.store(Arc::new(store))
        }
        None => {
            warn!("No database_path configured, using the in-memory store");
            builder.store(Arc::new(InMemoryStore::new()))
        }
    };

    Ok(builder.build()?)
}

async fn seed_notifications(pipeline: &Pipeline, topic: &str, count: usize) -> anyhow::Result<()> {
    let ids = UlidGenerator::new(SystemClock);
    for i in 0..count {
        let payload = EmailPayload::new(
            format!("user{}@example.com", i % 5),
            format!("sample #{i}"),
            "seeded by herald run --seed",
        );
        let event = NewOutboxEvent::new(
            ids.generate_outbox_id(),
            topic,
            format!("customer-{}", i % 5),
            serde_json::to_vec(&payload)?,
        );
        pipeline.outbox().insert(event, pipeline.clock().now()).await?;
    }
    info!(count, topic, "Seeded sample notifications");
    Ok(())
}

async fn status(config: &HeraldConfig) -> anyhow::Result<()> {
    let Some(path) = &config.database_path else {
        bail!("status needs database_path; the in-memory store starts empty");
    };
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    let counts = store.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
