mod config;
mod worker;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use shepherd_core::{ClusterNode, Consumer, NodeId, ShepherdError, SourceDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::LogWorker;

const WORKER_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "shepherd")]
#[command(about = "Cluster membership, leader election and consumer placement")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the cluster and run consumers until interrupted
    Run,
    /// List live cluster members
    Nodes,
    /// Manage consumers
    Consumer {
        #[command(subcommand)]
        command: ConsumerCommands,
    },
}

#[derive(Subcommand)]
enum ConsumerCommands {
    /// Register a consumer; the leader assigns it on its next pass
    Add {
        id: String,
        #[command(subcommand)]
        source: SourceArgs,
    },
    /// Delete a consumer; its node stops the worker on its next reconcile
    Remove { id: String },
    /// Print every consumer as one JSON object per line
    List,
}

#[derive(Subcommand)]
enum SourceArgs {
    /// Amazon SQS queue
    Sqs {
        #[arg(long)]
        queue_arn: String,
        #[arg(long, default_value_t = 1)]
        concurrency: u32,
    },
    /// Amazon Kinesis stream
    Kinesis {
        #[arg(long)]
        stream_name: String,
    },
}

impl From<SourceArgs> for SourceDescriptor {
    fn from(args: SourceArgs) -> Self {
        match args {
            SourceArgs::Sqs {
                queue_arn,
                concurrency,
            } => SourceDescriptor::Sqs {
                queue_arn,
                concurrency,
            },
            SourceArgs::Kinesis { stream_name } => SourceDescriptor::Kinesis { stream_name },
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shepherd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(cfg).await,
        Commands::Nodes => list_nodes(cfg).await,
        Commands::Consumer { command } => manage_consumers(cfg, command).await,
    };

    if let Err(error) = result {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let coordination = cfg.coordination.to_config()?;
    let store = cfg
        .store
        .builder()?
        .build()
        .await
        .context("failed to open store")?;

    let node_id = cfg
        .node
        .node_id
        .as_deref()
        .map(NodeId::new)
        .unwrap_or_else(NodeId::generate);

    tracing::info!(
        "Node ID: {}, Store: {} ({}), Lock: {}",
        node_id,
        store.backend_name(),
        cfg.store.namespace_or_default(),
        coordination.lock_key
    );

    let node = ClusterNode::new(
        node_id,
        cfg.node.address.clone(),
        store,
        coordination,
        Arc::new(LogWorker::new(WORKER_HEARTBEAT)),
    )?;
    node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down node {}", node.node_id());
    node.stop().await;
    Ok(())
}

async fn list_nodes(cfg: Config) -> anyhow::Result<()> {
    let store = cfg.store.builder()?.build().await?;
    for node in store.list_nodes(None).await? {
        println!(
            "{}\t{}\t{}",
            node.node_id,
            node.joined_at.to_rfc3339(),
            node.address.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn manage_consumers(cfg: Config, command: ConsumerCommands) -> anyhow::Result<()> {
    let store = cfg.store.builder()?.build().await?;

    match command {
        ConsumerCommands::Add { id, source } => {
            let consumer = Consumer::new(id, source.into());
            if !store.create_consumer(&consumer).await? {
                anyhow::bail!("consumer {} already exists", consumer.id);
            }
            tracing::info!("Registered consumer {} ({})", consumer.id, consumer.source);
        }
        ConsumerCommands::Remove { id } => {
            if !store.delete_consumer(&id).await? {
                return Err(ShepherdError::ConsumerNotFound(id).into());
            }
            tracing::info!("Removed consumer {}", id);
        }
        ConsumerCommands::List => {
            for consumer in store.fetch_consumers(None).await? {
                println!("{}", serde_json::to_string(&consumer)?);
            }
        }
    }

    Ok(())
}
