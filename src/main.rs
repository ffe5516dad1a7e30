//! ShardFollow - per-shard index replication node
//!
//! Serves the follow API over an in-process cluster, and drives a running
//! node from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardfollow::api::{ErrorResponse, FollowStatsResponse, HttpServer};
use shardfollow::config::NodeConfig;
use shardfollow::follow::{Coordinator, FollowParameters, PutFollowRequest};
use shardfollow::shard::{IndexSettings, LocalCluster};
use shardfollow::state::CheckpointStore;

/// ShardFollow - follow leader indices shard by shard
#[derive(Parser)]
#[command(name = "shardfollow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardfollow.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node serving the follow API
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardfollow.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Run a follow, pause and resume scenario in-process
    Demo {
        /// Documents indexed in the first burst
        #[arg(long, default_value_t = 50)]
        docs: usize,

        /// Leader shards
        #[arg(long, default_value_t = 2)]
        shards: u32,
    },

    /// Start following a leader index on a running node
    Follow {
        #[arg(short, long, default_value = "localhost:9280")]
        address: String,
        /// Leader index
        leader: String,
        /// Follower index to create
        follower: String,
    },

    /// Show follow stats of a running node
    Stats {
        #[arg(short, long, default_value = "localhost:9280")]
        address: String,
        /// Comma separated follower indices (all when omitted)
        #[arg(long)]
        indices: Option<String>,
    },

    /// Pause a follower index
    Pause {
        #[arg(short, long, default_value = "localhost:9280")]
        address: String,
        follower: String,
    },

    /// Resume a paused follower index
    Resume {
        #[arg(short, long, default_value = "localhost:9280")]
        address: String,
        follower: String,
    },

    /// Stop following; the follower index is kept
    Unfollow {
        #[arg(short, long, default_value = "localhost:9280")]
        address: String,
        follower: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli.log_level.clone();

    match cli.command {
        Commands::Start => run_start(cli.config, level).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Demo { docs, shards } => {
            init_logging(level.as_deref().unwrap_or("info"), "pretty");
            run_demo(docs, shards).await
        }
        command => {
            init_logging(level.as_deref().unwrap_or("warn"), "pretty");
            run_client(command).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf, level: Option<String>) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;

    init_logging(
        level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting shardfollow node {}", config.node.id);

    let store = CheckpointStore::new(config.state_dir())
        .with_context(|| format!("failed to open checkpoint store in {:?}", config.state_dir()))?;
    let cluster = Arc::new(LocalCluster::new());
    let coordinator = Arc::new(Coordinator::new(
        cluster.clone(),
        cluster.clone(),
        Arc::new(store),
        config.follow.clone(),
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
            shutdown.cancel();
        });
    }

    if config.api.enabled {
        let server = HttpServer::new(
            config.api.clone(),
            config.node.id.clone(),
            coordinator.clone(),
            cluster,
        );
        let signal = shutdown.clone();
        server.start(async move { signal.cancelled().await }).await?;
    } else {
        tracing::warn!("HTTP API disabled, nothing can be followed on this node");
        shutdown.cancelled().await;
    }

    coordinator.shutdown().await;
    tracing::info!("Node {} stopped", config.node.id);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let mut config = NodeConfig::with_node_id(&node_id);
    config.node.data_dir = PathBuf::from(format!("/var/lib/shardfollow/{}", node_id));
    let content = format!(
        "# ShardFollow Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("Then start with: shardfollow start --config {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match NodeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:        {}", config.node.id);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  API:            {} (enabled: {})", config.api.bind_address, config.api.enabled);
            println!(
                "  Reads:          {} ops x {} outstanding, poll {} ms",
                config.follow.max_read_request_operation_count,
                config.follow.max_outstanding_read_requests,
                config.follow.read_poll_timeout_ms
            );
            println!(
                "  Write buffer:   {} batches / {} ops",
                config.follow.max_write_buffer_count, config.follow.max_write_buffer_size
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Follow a local leader index, pause, write while paused, resume
async fn run_demo(docs: usize, shards: u32) -> anyhow::Result<()> {
    let cluster = Arc::new(LocalCluster::new());
    let params = FollowParameters {
        read_poll_timeout_ms: 20,
        ..FollowParameters::default()
    };
    let coordinator = Coordinator::new(
        cluster.clone(),
        cluster.clone(),
        Arc::new(CheckpointStore::in_memory()?),
        params,
    );

    cluster
        .create_index("leader", IndexSettings { number_of_shards: shards, soft_deletes: true })
        .await?;
    coordinator
        .put_follow(PutFollowRequest::new("leader", "follower"))
        .await?;
    println!("Following [leader] as [follower] with {} shards", shards);

    let mut expected = 0u64;
    for burst in [docs, docs * 3 / 5] {
        index_random_docs(&cluster, burst).await?;
        expected += burst as u64;
        let hits = wait_for_hits(&cluster, expected).await?;
        println!("Indexed {} more, follower hits: {}", burst, hits);
    }

    coordinator.pause_follow("follower").await?;
    let while_paused = (docs / 5).max(1);
    index_random_docs(&cluster, while_paused).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!(
        "Paused, indexed {} more, follower hits: {}",
        while_paused,
        cluster.doc_count("follower").await?
    );

    coordinator.resume_follow("follower", None).await?;
    expected += while_paused as u64;
    let hits = wait_for_hits(&cluster, expected).await?;
    println!("Resumed, follower hits: {}", hits);

    for stats in coordinator.stats(None).await {
        println!(
            "  [{}][{}] {} checkpoint={} applied={} lag={}",
            stats.follower_index,
            stats.shard_id,
            stats.state,
            stats.last_applied_seq_no,
            stats.operations_applied,
            stats.lag
        );
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn index_random_docs(cluster: &LocalCluster, count: usize) -> anyhow::Result<()> {
    for _ in 0..count {
        let value: u32 = rand::thread_rng().gen_range(0..10_000);
        cluster
            .index_document("leader", None, json!({ "field": value }))
            .await?;
    }
    Ok(())
}

async fn wait_for_hits(cluster: &LocalCluster, expected: u64) -> anyhow::Result<u64> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let hits = cluster.doc_count("follower").await?;
        if hits >= expected {
            return Ok(hits);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("follower reached {} of {} hits before timing out", hits, expected);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Commands against a running node
async fn run_client(command: Commands) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    match command {
        Commands::Follow { address, leader, follower } => {
            let body: serde_json::Value = send(
                client
                    .put(format!("http://{}/{}/_follow", address, follower))
                    .json(&json!({ "leader_index": leader })),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Stats { address, indices } => {
            let mut request = client.get(format!("http://{}/_follow/stats", address));
            if let Some(indices) = indices {
                request = request.query(&[("indices", indices)]);
            }
            let stats: FollowStatsResponse = send(request).await?;
            print_stats(&stats);
        }
        Commands::Pause { address, follower } => {
            let _: serde_json::Value =
                send(client.post(format!("http://{}/{}/_pause_follow", address, follower))).await?;
            println!("Paused [{}]", follower);
        }
        Commands::Resume { address, follower } => {
            let _: serde_json::Value =
                send(client.post(format!("http://{}/{}/_resume_follow", address, follower))).await?;
            println!("Resumed [{}]", follower);
        }
        Commands::Unfollow { address, follower } => {
            let _: serde_json::Value =
                send(client.post(format!("http://{}/{}/_unfollow", address, follower))).await?;
            println!("[{}] no longer follows its leader", follower);
        }
        Commands::Start | Commands::Init { .. } | Commands::Validate | Commands::Demo { .. } => {
            bail!("not a client command")
        }
    }
    Ok(())
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> anyhow::Result<T> {
    let response = request.send().await.context("failed to reach node")?;
    let status = response.status();
    if !status.is_success() {
        let error: ErrorResponse = response
            .json()
            .await
            .with_context(|| format!("request failed with status {}", status))?;
        bail!("{} ({}): {}", status, error.code, error.error);
    }
    Ok(response.json().await?)
}

fn print_stats(stats: &FollowStatsResponse) {
    if stats.indices.is_empty() {
        println!("No follower indices");
        return;
    }
    for index in &stats.indices {
        println!("{}", index.index);
        for shard in &index.shards {
            println!(
                "  shard {:>3}  {:<9} checkpoint {:>8}  leader {:>8}  lag {:>6}  buffered {:>5}",
                shard.shard_id,
                shard.state.to_string(),
                shard.last_applied_seq_no,
                shard.leader_max_seq_no,
                shard.lag,
                shard.write_buffer_operation_count
            );
            if let Some(reason) = &shard.last_failure_reason {
                println!("             failure: {}", reason);
            }
        }
    }
}
