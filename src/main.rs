use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::{mpsc, Mutex};

use quorum::network::proto::kv_service_server::KvServiceServer;
use quorum::network::proto::raft_service_server::RaftServiceServer;
use quorum::network::{GrpcTransport, KvClient, KvServer, RaftServer};
use quorum::raft::{Raft, RaftConfig};
use quorum::store::{Command as KvCommand, KvStore};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "A replicated key-value store built on Raft consensus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cluster node
    Node {
        /// Unique ID for this node
        #[arg(short, long)]
        id: String,

        /// Directory to store data
        #[arg(short, long, default_value = "data")]
        data_dir: String,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        address: String,

        /// Comma-separated list of peer addresses (id=address)
        #[arg(short, long)]
        peers: Option<String>,

        /// Clean the data directory before starting
        #[arg(long)]
        clean: bool,

        /// Lower bound of the randomized election timeout, in milliseconds
        #[arg(long, default_value_t = 150)]
        election_timeout_min: u64,

        /// Upper bound of the randomized election timeout, in milliseconds
        #[arg(long, default_value_t = 300)]
        election_timeout_max: u64,

        /// Leader heartbeat interval, in milliseconds
        #[arg(long, default_value_t = 50)]
        heartbeat_interval: u64,
    },

    /// Write a value through the leader
    Put {
        /// Address of the leader node
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        leader: String,

        key: String,
        value: String,
    },

    /// Read a value from the leader
    Get {
        /// Address of the leader node
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        leader: String,

        key: String,
    },

    /// Delete a key through the leader
    Del {
        /// Address of the leader node
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        leader: String,

        key: String,
    },

    /// Show consensus status of a node
    Status {
        /// Address of any cluster node
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // Parse command line arguments
    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            id,
            data_dir,
            address,
            peers,
            clean,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
        } => {
            info!("Starting quorum node {id} at {address}");

            let node_data_dir = format!("{data_dir}/{id}");

            if clean {
                info!(
                    "--clean flag detected, removing data directory: {}",
                    &node_data_dir
                );
                let node_data_path = Path::new(&node_data_dir);
                if node_data_path.exists() {
                    std::fs::remove_dir_all(node_data_path)?;
                }
            }

            // Create data directory for this node
            std::fs::create_dir_all(&node_data_dir)?;

            // Configure Raft for this node (including peers)
            let mut config = RaftConfig::new(&id, &node_data_dir);
            config.election_timeout_min = election_timeout_min;
            config.election_timeout_max = election_timeout_max;
            config.heartbeat_interval = heartbeat_interval;

            if let Some(peers_str) = peers {
                for peer in peers_str.split(',') {
                    let parts: Vec<&str> = peer.split('=').collect();
                    if parts.len() != 2 {
                        anyhow::bail!("Invalid peer '{peer}', expected id=address");
                    }
                    let peer_id = parts[0];
                    let peer_addr = parts[1];

                    if peer_id != id {
                        config.add_peer(peer_id, peer_addr);
                        info!("Added peer: {peer_id} at {peer_addr}");
                    }
                }
            }

            // Consensus messages travel over gRPC in production
            let transport = Arc::new(GrpcTransport::new(config.peers.clone()));
            let raft = Raft::new(config, transport)?;

            // The replicated state machine and the worker that feeds it
            // committed commands in log order
            let store = Arc::new(Mutex::new(KvStore::new()));
            let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            {
                let mut node_lock = raft.node.lock().await;
                node_lock.set_apply_sender(apply_tx);
            }
            {
                let store_for_apply = Arc::clone(&store);
                tokio::spawn(async move {
                    while let Some(bytes) = apply_rx.recv().await {
                        match KvCommand::decode(&bytes) {
                            Ok(command) => {
                                let mut store = store_for_apply.lock().await;
                                store.apply(command);
                            }
                            Err(e) => {
                                // The entry is already committed; skipping it
                                // is the only option left.
                                error!("Apply worker could not decode command: {e}");
                            }
                        }
                    }
                });
            }

            raft.start().await?;

            // Start gRPC server
            let addr = address
                .parse()
                .with_context(|| format!("Invalid listen address '{address}'"))?;
            let raft_server = RaftServer::new(Arc::clone(&raft.node));
            let kv_server = KvServer::new(Arc::clone(&raft.node), Arc::clone(&store));

            info!("gRPC server listening on {addr}");
            tonic::transport::Server::builder()
                .add_service(RaftServiceServer::new(raft_server))
                .add_service(KvServiceServer::new(kv_server))
                .serve(addr)
                .await?;
        }
        Command::Put { leader, key, value } => {
            let mut client = KvClient::new(&leader);
            let response = client
                .put(&key, value.into_bytes())
                .await
                .with_context(|| format!("Put to {leader} failed"))?;

            if !response.success {
                if response.leader_hint.is_empty() {
                    anyhow::bail!("Put rejected: {}", response.error);
                }
                anyhow::bail!(
                    "Put rejected: {} (try leader {})",
                    response.error,
                    response.leader_hint
                );
            }
            println!("OK (index {})", response.index);
        }
        Command::Get { leader, key } => {
            let mut client = KvClient::new(&leader);
            let response = client
                .get(&key)
                .await
                .with_context(|| format!("Get from {leader} failed"))?;

            if !response.success {
                if response.leader_hint.is_empty() {
                    anyhow::bail!("Get rejected: {}", response.error);
                }
                anyhow::bail!(
                    "Get rejected: {} (try leader {})",
                    response.error,
                    response.leader_hint
                );
            }
            if response.found {
                println!("{}", String::from_utf8_lossy(&response.value));
            } else {
                println!("(not found)");
            }
        }
        Command::Del { leader, key } => {
            let mut client = KvClient::new(&leader);
            let response = client
                .delete(&key)
                .await
                .with_context(|| format!("Delete to {leader} failed"))?;

            if !response.success {
                if response.leader_hint.is_empty() {
                    anyhow::bail!("Delete rejected: {}", response.error);
                }
                anyhow::bail!(
                    "Delete rejected: {} (try leader {})",
                    response.error,
                    response.leader_hint
                );
            }
            println!("OK (index {})", response.index);
        }
        Command::Status { address } => {
            let mut client = KvClient::new(&address);
            let status = client
                .status()
                .await
                .with_context(|| format!("Status from {address} failed"))?;

            let report = serde_json::json!({
                "node_id": status.node_id,
                "role": status.role,
                "term": status.term,
                "leader_id": status.leader_id,
                "commit_index": status.commit_index,
                "last_applied": status.last_applied,
                "last_log_index": status.last_log_index,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
