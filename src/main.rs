use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;

use raftkv::config::Config;
use raftkv::network::{RaftServer, TcpTransport};
use raftkv::raft::{Raft, RpcHandler};
use raftkv::store::{now_ms, KvStore};

/// Logs to stderr, or appends to the file named by `RAFTKV_LOG_FILE`.
fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Ok(path) = std::env::var("RAFTKV_LOG_FILE") {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}, logging to stderr"),
        }
    }

    builder.init();
}

#[derive(Parser)]
#[command(name = "raftkv")]
#[command(about = "A replicated key-value store kept consistent by Raft")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node in a cluster
    Node {
        /// JSON config file; flags given here override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Unique ID for this node
        #[arg(short, long)]
        id: Option<String>,

        /// Directory to store data
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Address to listen on for peer RPCs
        #[arg(short, long)]
        address: Option<String>,

        /// Comma-separated list of peers (id=address)
        #[arg(short, long)]
        peers: Option<String>,

        /// Remove this node's data directory before starting
        #[arg(long)]
        clean: bool,

        /// Interval in seconds between expired-key purges
        #[arg(long)]
        ttl_purge_interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            config,
            id,
            data_dir,
            address,
            peers,
            clean,
            ttl_purge_interval_secs,
        } => {
            let mut cfg = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(id) = id {
                cfg.node_id = id;
            }
            if let Some(data_dir) = data_dir {
                cfg.data_dir = data_dir;
            }
            if let Some(address) = address {
                cfg.address = address;
            }
            if let Some(peers) = peers {
                cfg.peers = Config::parse_peers(&peers)?;
            }
            if let Some(secs) = ttl_purge_interval_secs {
                cfg.ttl_purge_interval_secs = secs;
            }

            run_node(cfg, clean).await?;
        }
    }

    Ok(())
}

async fn run_node(cfg: Config, clean: bool) -> anyhow::Result<()> {
    let raft_config = cfg.to_raft_config()?;
    info!("Starting raftkv node {} at {}", cfg.node_id, cfg.address);

    let node_data_dir = cfg.node_data_dir();
    if clean && node_data_dir.exists() {
        info!(
            "--clean flag detected, removing data directory: {}",
            node_data_dir.display()
        );
        std::fs::remove_dir_all(&node_data_dir)?;
    }
    std::fs::create_dir_all(&node_data_dir)?;

    for (peer_id, peer_addr) in &raft_config.peers {
        info!("Peer {peer_id} at {peer_addr}");
    }

    let transport = Arc::new(TcpTransport::new(&raft_config.peers, raft_config.rpc_timeout()));
    let store = Arc::new(KvStore::new());
    let raft = Raft::new(raft_config, transport, Arc::clone(&store))?;

    let listener = TcpListener::bind(&cfg.address)
        .await
        .with_context(|| format!("binding {}", cfg.address))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handler: Arc<dyn RpcHandler> = raft.clone();
    let server = RaftServer::new(handler);
    let serving = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    raft.start().await;

    // Expired keys are purged on every node independently
    {
        let store = Arc::clone(&store);
        let interval = cfg.ttl_purge_interval();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(interval) => {}
                }
                let purged = store.purge_expired(now_ms());
                if purged > 0 {
                    info!("TTL purge removed {purged} expired keys");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    let _ = shutdown_tx.send(true);
    raft.shutdown().await;
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("RPC server error: {e}"),
        Err(e) => error!("RPC server task failed: {e}"),
    }

    let status = raft.status().await;
    info!(
        "Node {} stopped at term {} with commit index {}",
        status.id, status.current_term, status.commit_index
    );
    Ok(())
}
