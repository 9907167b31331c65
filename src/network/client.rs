use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::raft::{LogEntry, RaftError, RaftMessage, RaftTransport};

use crate::network::proto::kv_service_client::KvServiceClient;
use crate::network::proto::raft_service_client::RaftServiceClient;
use crate::network::proto::{
    AppendEntriesRequest, DeleteRequest, DeleteResponse, GetRequest, GetResponse, PutRequest,
    PutResponse, RequestVoteRequest, StatusRequest, StatusResponse,
};

use super::NetworkError;

pub struct RaftClient {
    address: String,
    client: Option<RaftServiceClient<Channel>>,
}

impl RaftClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.address))
            .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

        let channel = endpoint
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .connect()
            .await?;

        self.client = Some(RaftServiceClient::new(channel));

        Ok(())
    }

    pub async fn request_vote(
        &mut self,
        term: u64,
        candidate_id: &str,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<RaftMessage, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: candidate_id.to_string(),
            last_log_index,
            last_log_term,
        };

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .request_vote(Request::new(request))
            .await?
            .into_inner();

        Ok(RaftMessage::RequestVoteResponse {
            term: response.term,
            vote_granted: response.vote_granted,
        })
    }

    pub async fn append_entries(
        &mut self,
        term: u64,
        leader_id: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<RaftMessage, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        // Convert entries to proto format
        let proto_entries = entries
            .into_iter()
            .map(|e| super::proto::LogEntry {
                term: e.term,
                index: e.index,
                command: e.command,
            })
            .collect();

        let request = AppendEntriesRequest {
            term,
            leader_id: leader_id.to_string(),
            prev_log_index,
            prev_log_term,
            entries: proto_entries,
            leader_commit,
        };

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .append_entries(Request::new(request))
            .await?
            .into_inner();

        Ok(RaftMessage::AppendEntriesResponse {
            term: response.term,
            success: response.success,
            match_index: response.match_index,
        })
    }
}

/// Production transport: one gRPC exchange per consensus message, resolved
/// through a static peer address book. Connections are not pooled; a tick
/// that cannot reach a peer just fails and the next tick tries again.
pub struct GrpcTransport {
    peers: HashMap<String, String>, // node_id -> address
}

impl GrpcTransport {
    pub fn new(peers: HashMap<String, String>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl RaftTransport for GrpcTransport {
    async fn send(&self, peer_id: &str, message: RaftMessage) -> Result<RaftMessage, RaftError> {
        let address = self
            .peers
            .get(peer_id)
            .ok_or_else(|| RaftError::NetworkError(format!("Unknown peer: {peer_id}")))?;

        let mut client = RaftClient::new(address);

        let reply = match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                client
                    .request_vote(term, &candidate_id, last_log_index, last_log_term)
                    .await
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                client
                    .append_entries(
                        term,
                        &leader_id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit,
                    )
                    .await
            }
            other => {
                return Err(RaftError::NetworkError(format!(
                    "Not a request message: {other:?}"
                )))
            }
        };

        reply.map_err(|e| RaftError::NetworkError(e.to_string()))
    }
}

pub struct KvClient {
    address: String,
    client: Option<KvServiceClient<Channel>>,
}

impl KvClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.address))
            .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

        let channel = endpoint
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .connect()
            .await?;

        self.client = Some(KvServiceClient::new(channel));

        Ok(())
    }

    pub async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<PutResponse, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        let request = PutRequest {
            key: key.to_string(),
            value,
        };

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .put(Request::new(request))
            .await?
            .into_inner();

        Ok(response)
    }

    pub async fn delete(&mut self, key: &str) -> Result<DeleteResponse, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        let request = DeleteRequest {
            key: key.to_string(),
        };

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .delete(Request::new(request))
            .await?
            .into_inner();

        Ok(response)
    }

    pub async fn get(&mut self, key: &str) -> Result<GetResponse, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        let request = GetRequest {
            key: key.to_string(),
        };

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .get(Request::new(request))
            .await?
            .into_inner();

        Ok(response)
    }

    pub async fn status(&mut self) -> Result<StatusResponse, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }

        let response = self
            .client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?
            .status(Request::new(StatusRequest {}))
            .await?
            .into_inner();

        Ok(response)
    }
}
