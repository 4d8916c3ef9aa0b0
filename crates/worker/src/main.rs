use anyhow::Result;
use clap::{Parser, Subcommand};
use docker::DockerDriver;
use executor::ContainerRuntime;
use metadata::SeaOrmMetadataStore;
use queue::RedisQueue;
use std::sync::Arc;
use storage::LocalCodeStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "worker", about = "FaaS execution worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker loop.
    Start {
        /// Override the WORKER_ID environment variable.
        #[arg(long)]
        worker_id: Option<String>,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { worker_id } => {
            let mut config = WorkerConfig::from_env()?;
            if let Some(worker_id) = worker_id {
                config.worker_id = worker_id;
            }
            start(config).await
        }
    }
}

async fn start(config: WorkerConfig) -> Result<()> {
    info!(worker_id = %config.worker_id, "starting worker");

    let store = Arc::new(SeaOrmMetadataStore::connect(&config.database_url).await?);
    info!("metadata store connected");

    let queue = Arc::new(RedisQueue::new(&config.redis_url, &config.queue_prefix)?);
    let code_store = Arc::new(LocalCodeStore::new(&config.code_store_path).await?);

    let driver = Arc::new(DockerDriver::new()?);
    let runtime = Arc::new(ContainerRuntime::new(driver, &config.work_dir).await?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received, finishing in-flight work");
            shutdown.cancel();
        });
    }

    let worker = Worker::new(
        config.worker_id,
        queue,
        store,
        code_store,
        runtime,
        config.poll_timeout,
        shutdown,
    );

    worker.run().await;
    Ok(())
}
