use std::collections::HashMap;

use super::RaftError;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    pub data_dir: String,
    pub peers: HashMap<String, String>, // node_id -> address
    pub election_timeout_min: u64,      // in milliseconds
    pub election_timeout_max: u64,      // in milliseconds
    pub heartbeat_interval: u64,        // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: &str, data_dir: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            data_dir: data_dir.to_string(),
            peers: HashMap::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, address: &str) {
        self.peers.insert(peer_id.to_string(), address.to_string());
    }

    /// Number of votes a candidate needs: a strict majority of the cluster,
    /// this node included.
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// The randomized timeout range keeps split votes rare, and the
    /// heartbeat interval must sit below it or a healthy leader would get
    /// deposed by its own followers.
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.is_empty() {
            return Err(RaftError::InvalidConfig("node_id is empty".to_string()));
        }
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is invalid",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} listed among its own peers",
                self.node_id
            )));
        }
        Ok(())
    }
}
