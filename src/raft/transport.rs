use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
// Use external log crate, not our own log module
use ::log::{debug, error};

use super::{RaftError, RaftMessage, RaftNode};

/// How long a channel RPC waits for the remote node to answer.
const CHANNEL_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Delivers consensus messages between named nodes.
///
/// The core never talks to a socket directly: it hands a request variant of
/// [`RaftMessage`] to the transport and gets the matching response variant
/// back. Delivery is best effort; the protocol tolerates lost, duplicated
/// and reordered messages, so implementations just surface failures as
/// errors and leave retries to the next tick.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send(&self, peer_id: &str, message: RaftMessage) -> Result<RaftMessage, RaftError>;
}

/// Envelope for in-process RPC delivery: the request plus a oneshot the
/// serving side answers on.
pub struct RpcEnvelope {
    pub from: String,
    pub message: RaftMessage,
    pub reply_tx: oneshot::Sender<RaftMessage>,
}

pub type RpcSender = mpsc::Sender<RpcEnvelope>;
pub type RpcReceiver = mpsc::Receiver<RpcEnvelope>;

/// In-process transport over tokio channels, used by the cluster tests.
///
/// Every node owns an [`RpcReceiver`] pumped by [`spawn_rpc_server`]; this
/// side holds the senders. Removing a link makes the peer unreachable,
/// which is how tests simulate partitions.
pub struct ChannelTransport {
    local_id: String,
    links: Arc<Mutex<HashMap<String, RpcSender>>>,
}

impl ChannelTransport {
    pub fn new(local_id: &str, links: HashMap<String, RpcSender>) -> Self {
        Self {
            local_id: local_id.to_string(),
            links: Arc::new(Mutex::new(links)),
        }
    }

    /// Cut the link to `peer_id`; sends start failing immediately.
    pub fn sever(&self, peer_id: &str) -> Option<RpcSender> {
        self.links.lock().unwrap().remove(peer_id)
    }

    /// Restore (or add) a link to `peer_id`.
    pub fn restore(&self, peer_id: &str, sender: RpcSender) {
        self.links.lock().unwrap().insert(peer_id.to_string(), sender);
    }

    fn link(&self, peer_id: &str) -> Option<RpcSender> {
        self.links.lock().unwrap().get(peer_id).cloned()
    }
}

#[async_trait]
impl RaftTransport for ChannelTransport {
    async fn send(&self, peer_id: &str, message: RaftMessage) -> Result<RaftMessage, RaftError> {
        let link = self
            .link(peer_id)
            .ok_or_else(|| RaftError::NetworkError(format!("no link to peer {peer_id}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        link.send(RpcEnvelope {
            from: self.local_id.clone(),
            message,
            reply_tx,
        })
        .await
        .map_err(|_| RaftError::NetworkError(format!("peer {peer_id} is gone")))?;

        match tokio::time::timeout(CHANNEL_RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RaftError::NetworkError(format!(
                "peer {peer_id} dropped the request"
            ))),
            Err(_) => Err(RaftError::Timeout),
        }
    }
}

/// Serve a node's incoming channel RPCs: each envelope is run through
/// `handle_message` under the node lock and the response is sent back on
/// the envelope's oneshot. Ends when all senders are dropped.
pub fn spawn_rpc_server(
    node: Arc<tokio::sync::Mutex<RaftNode>>,
    mut rx: RpcReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let reply = {
                let mut node = node.lock().await;
                node.handle_message(envelope.message)
            };

            match reply {
                Ok(Some(response)) => {
                    // The caller may have timed out; nothing to do then.
                    let _ = envelope.reply_tx.send(response);
                }
                Ok(None) => {
                    debug!("dropping RPC from {} with no response", envelope.from);
                }
                Err(e) => {
                    error!("error handling RPC from {}: {e}", envelope.from);
                    if e.is_fatal() {
                        break;
                    }
                }
            }
        }
    })
}
