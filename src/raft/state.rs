use serde::{Deserialize, Serialize};

use super::RaftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// Per-node consensus state. `current_term` and `voted_for` are persisted
/// (see `HardState`); the rest is volatile and rebuilt after a restart.
///
/// Invariants: `last_applied <= commit_index <= log.last_index()`;
/// `current_term` never decreases; at most one vote per term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: NodeRole,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
        }
    }

    /// Step down to follower. Idempotent; a higher term wipes the vote.
    /// Returns true when persistent state (term/vote) changed.
    pub fn become_follower(&mut self, term: u64) -> bool {
        self.role = NodeRole::Follower;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            return true;
        }
        false
    }

    /// Start a new election round: bump the term and vote for ourselves.
    /// Only a follower or a candidate retrying may do this.
    pub fn become_candidate(&mut self, self_id: &str) -> Result<(), RaftError> {
        if self.role == NodeRole::Leader {
            return Err(RaftError::InvalidTransition("leader cannot become candidate"));
        }
        self.current_term += 1;
        self.role = NodeRole::Candidate;
        self.voted_for = Some(self_id.to_string());
        self.leader_id = None;
        Ok(())
    }

    /// Promote to leader. Only a candidate that collected its majority may
    /// call this; the caller initializes replication state afterwards.
    pub fn become_leader(&mut self, self_id: &str) -> Result<(), RaftError> {
        if self.role != NodeRole::Candidate {
            return Err(RaftError::InvalidTransition("only a candidate may become leader"));
        }
        self.role = NodeRole::Leader;
        self.leader_id = Some(self_id.to_string());
        Ok(())
    }

    /// Raise the commit index, clamped to what the log actually holds.
    /// Never moves backwards.
    pub fn advance_commit(&mut self, new_commit: u64, last_log_index: u64) {
        let target = new_commit.min(last_log_index);
        if target > self.commit_index {
            self.commit_index = target;
        }
    }

    /// Vote-granting log check: the candidate's log must be at least as
    /// up to date as ours (later last term, or same term and no shorter).
    pub fn log_up_to_date(
        &self,
        candidate_last_index: u64,
        candidate_last_term: u64,
        our_last_index: u64,
        our_last_term: u64,
    ) -> bool {
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}
