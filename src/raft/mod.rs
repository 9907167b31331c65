mod error;
mod node;
mod log;
mod state;
mod config;
mod transport;

pub use self::error::RaftError;
pub use self::node::RaftNode;
pub use self::log::{HardState, Log, LogEntry};
pub use self::state::{NodeState, NodeRole};
pub use self::config::RaftConfig;
pub use self::transport::{
    spawn_rpc_server, ChannelTransport, RaftTransport, RpcEnvelope, RpcReceiver, RpcSender,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio::sync::{mpsc, oneshot, Mutex};
// Use external log crate, not our own log module
use ::log::{info, error, debug};

// Message types for Raft communication
#[derive(Debug, Clone)]
pub enum RaftMessage {
    // Leader election messages
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    RequestVoteResponseFromPeer {
        peer_id: String,
        term: u64,
        vote_granted: bool,
    },

    // Log replication messages
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
    },
    AppendEntriesResponseFromPeer {
        peer_id: String,
        term: u64,
        success: bool,
        match_index: u64,
    },
}

// Main Raft service
pub struct Raft {
    pub node: Arc<Mutex<RaftNode>>,
}

impl Raft {
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self, RaftError> {
        let node = RaftNode::new(config, transport)?;
        Ok(Self {
            node: Arc::new(Mutex::new(node)),
        })
    }

    /// Spawn the two driver tasks: a pump feeding peer responses back into
    /// the node, and the tick loop that replicates (as leader) or watches
    /// the election timer (otherwise). Both stop once the node halts.
    pub async fn start(&self) -> Result<(), RaftError> {
        let node = Arc::clone(&self.node);

        // Create channels for message passing
        let (tx, mut rx) = mpsc::channel(100);

        // Store the sender in the node
        {
            let mut node_lock = node.lock().await;
            node_lock.set_message_sender(tx.clone());
        }

        // Spawn a task to handle incoming messages
        let node_clone = Arc::clone(&node);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut node = node_clone.lock().await;
                match node.handle_message(message) {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!("Stopping message loop: {e}");
                        break;
                    }
                    Err(e) => error!("Error handling message: {e}"),
                }
            }
        });

        // Spawn the tick loop. Every heartbeat interval a leader fans out
        // AppendEntries (which doubles as catch-up for lagging followers),
        // while everyone else checks whether the leader has gone quiet.
        let node_clone = Arc::clone(&node);
        tokio::spawn(async move {
            loop {
                let tick = {
                    let node = node_clone.lock().await;
                    if node.is_halted() {
                        error!("Node halted, stopping tick loop");
                        return;
                    }
                    Duration::from_millis(node.config().heartbeat_interval)
                };

                sleep(tick).await;

                let mut node = node_clone.lock().await;
                if node.is_leader() {
                    match node.broadcast_append_entries() {
                        Ok(_) => debug!("Replication tick"),
                        Err(e) => error!("Error replicating: {e}"),
                    }
                } else if node.election_timeout_elapsed() {
                    info!("Election timeout elapsed, starting election");
                    match node.start_election() {
                        Ok(_) => debug!("Started election"),
                        Err(e) => error!("Error starting election: {e}"),
                    }
                }
            }
        });

        Ok(())
    }

    /// Propose a command through the consensus log. See
    /// [`RaftNode::submit_command`] for the completion contract.
    pub async fn submit_command(
        &self,
        command: Vec<u8>,
    ) -> Result<(u64, oneshot::Receiver<()>), RaftError> {
        let mut node = self.node.lock().await;
        node.submit_command(command)
    }
}
