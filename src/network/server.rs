use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use log::{debug, error};

use crate::network::proto::kv_service_server::KvService;
use crate::network::proto::raft_service_server::RaftService;
use crate::raft::{RaftError, RaftMessage, RaftNode};
use crate::store::{Command, KvStore};

use super::proto::*;

/// How long a client write may wait for its entry to commit before the
/// server gives up on the request (the entry itself may still commit).
const COMMIT_WAIT: Duration = Duration::from_secs(5);

pub struct RaftServer {
    node: Arc<Mutex<RaftNode>>,
}

impl RaftServer {
    pub fn new(node: Arc<Mutex<RaftNode>>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn request_vote(
        &self,
        request: Request<RequestVoteRequest>,
    ) -> Result<Response<RequestVoteResponse>, Status> {
        let req = request.into_inner();
        debug!("Received RequestVote: {:?}", req);

        let mut node = self.node.lock().await;

        // Convert to internal message format
        let message = RaftMessage::RequestVote {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        };

        let mut response = RequestVoteResponse {
            term: node.state().current_term,
            vote_granted: false,
        };

        match node.handle_message(message) {
            Ok(reply) => {
                if let Some(RaftMessage::RequestVoteResponse { term, vote_granted }) = reply {
                    response.term = term;
                    response.vote_granted = vote_granted;
                }
            }
            Err(e) => {
                error!("Error handling RequestVote: {e}");
                return Err(Status::internal(format!("Internal error: {e}")));
            }
        }

        Ok(Response::new(response))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        debug!(
            "Received AppendEntries: term={}, leader={}, entries={}",
            req.term,
            req.leader_id,
            req.entries.len()
        );

        let mut node = self.node.lock().await;

        // Convert entries to internal format
        let entries = req
            .entries
            .into_iter()
            .map(|e| crate::raft::LogEntry {
                term: e.term,
                index: e.index,
                command: e.command,
            })
            .collect();

        let message = RaftMessage::AppendEntries {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries,
            leader_commit: req.leader_commit,
        };

        let mut response = AppendEntriesResponse {
            term: node.state().current_term,
            success: false,
            match_index: 0,
        };

        match node.handle_message(message) {
            Ok(reply) => {
                if let Some(RaftMessage::AppendEntriesResponse {
                    term,
                    success,
                    match_index,
                }) = reply
                {
                    response.term = term;
                    response.success = success;
                    response.match_index = match_index;
                }
            }
            Err(e) => {
                error!("Error handling AppendEntries: {e}");
                return Err(Status::internal(format!("Internal error: {e}")));
            }
        }

        Ok(Response::new(response))
    }
}

/// Outcome of proposing one command through the log, shared by the Put and
/// Delete handlers which differ only in their response message type.
struct WriteOutcome {
    success: bool,
    error: String,
    leader_hint: String,
    index: u64,
}

pub struct KvServer {
    node: Arc<Mutex<RaftNode>>,
    store: Arc<Mutex<KvStore>>,
}

impl KvServer {
    pub fn new(node: Arc<Mutex<RaftNode>>, store: Arc<Mutex<KvStore>>) -> Self {
        Self { node, store }
    }

    async fn leader_hint(&self) -> String {
        let node = self.node.lock().await;
        node.state().leader_id.clone().unwrap_or_default()
    }

    /// Submit a command and wait for the commit notification. The client
    /// is only told "success" once the entry is committed and applied;
    /// anything else is reported as a retryable failure.
    async fn submit_and_wait(&self, command: Command) -> Result<WriteOutcome, Status> {
        let encoded = command
            .encode()
            .map_err(|e| Status::internal(format!("Serialization error: {e}")))?;

        let submitted = {
            let mut node = self.node.lock().await;
            node.submit_command(encoded)
        };

        let (index, commit_rx) = match submitted {
            Ok(pair) => pair,
            Err(RaftError::NotLeader) => {
                return Ok(WriteOutcome {
                    success: false,
                    error: "Not the leader".to_string(),
                    leader_hint: self.leader_hint().await,
                    index: 0,
                });
            }
            Err(e) => {
                error!("Error submitting command: {e}");
                return Err(Status::internal(format!("Raft error: {e}")));
            }
        };

        match tokio::time::timeout(COMMIT_WAIT, commit_rx).await {
            Ok(Ok(())) => Ok(WriteOutcome {
                success: true,
                error: String::new(),
                leader_hint: String::new(),
                index,
            }),
            // Sender dropped: leadership was lost before the entry
            // committed. It may still commit under the next leader, so the
            // client has to retry and judge by the outcome.
            Ok(Err(_)) => Ok(WriteOutcome {
                success: false,
                error: "Leadership lost before commit".to_string(),
                leader_hint: self.leader_hint().await,
                index: 0,
            }),
            Err(_) => Ok(WriteOutcome {
                success: false,
                error: "Timed out waiting for commit".to_string(),
                leader_hint: String::new(),
                index: 0,
            }),
        }
    }
}

#[tonic::async_trait]
impl KvService for KvServer {
    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        debug!("Received Put: key={}", req.key);

        let outcome = self
            .submit_and_wait(Command::Put {
                key: req.key,
                value: req.value,
            })
            .await?;

        Ok(Response::new(PutResponse {
            success: outcome.success,
            error: outcome.error,
            leader_hint: outcome.leader_hint,
            index: outcome.index,
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        debug!("Received Delete: key={}", req.key);

        let outcome = self.submit_and_wait(Command::Delete { key: req.key }).await?;

        Ok(Response::new(DeleteResponse {
            success: outcome.success,
            error: outcome.error,
            leader_hint: outcome.leader_hint,
            index: outcome.index,
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        debug!("Received Get: key={}", req.key);

        let node = self.node.lock().await;

        if !node.is_leader() {
            return Ok(Response::new(GetResponse {
                success: false,
                error: "Not the leader".to_string(),
                leader_hint: node.state().leader_id.clone().unwrap_or_default(),
                found: false,
                value: vec![],
            }));
        }

        // A leader cut off from the majority keeps its role until a higher
        // term reaches it; the lease is what stops it from serving reads
        // that another leader may already have overwritten.
        if !node.can_serve_read_locally() {
            return Ok(Response::new(GetResponse {
                success: false,
                error: "Leader lease expired, retry".to_string(),
                leader_hint: String::new(),
                found: false,
                value: vec![],
            }));
        }

        // Lock order: node, then store. The apply worker only ever takes
        // the store lock.
        let store = self.store.lock().await;
        let value = store.get(&req.key);

        Ok(Response::new(GetResponse {
            success: true,
            error: String::new(),
            leader_hint: String::new(),
            found: value.is_some(),
            value: value.unwrap_or_default(),
        }))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let node = self.node.lock().await;
        let state = node.state();

        Ok(Response::new(StatusResponse {
            node_id: node.config().node_id.clone(),
            role: state.role.to_string(),
            term: state.current_term,
            leader_id: state.leader_id.clone().unwrap_or_default(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: node.last_log_index(),
        }))
    }
}
