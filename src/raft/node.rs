use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

use super::transport::RaftTransport;
use super::{HardState, Log, LogEntry, NodeRole, NodeState, RaftConfig, RaftError, RaftMessage};

pub struct RaftNode {
    // Node identity
    id: String,

    // Raft state
    state: NodeState,
    log: Log,
    // Term/vote changed since the last save; flushed before any reply leaves.
    hard_state_dirty: bool,
    // Set after a failed durable write. A halted node stops participating;
    // a node that cannot remember its vote must not cast another one.
    halted: bool,

    // Configuration
    config: RaftConfig,

    // Communication
    peers: HashMap<String, String>, // node_id -> address
    transport: Arc<dyn RaftTransport>,
    message_sender: Option<mpsc::Sender<RaftMessage>>,

    // Election state
    last_election_time: Instant,
    election_timeout: Duration,
    votes_received: HashSet<String>,

    // Leader state
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    // When each peer last answered an AppendEntries in the current term.
    // Acks younger than `lease_duration` from a majority back the read
    // lease; fan-out alone proves nothing.
    last_ack: HashMap<String, Instant>,
    lease_duration: Duration,
    // Optional channel to forward committed commands to an external state
    // machine (e.g., the key-value store) for application.
    apply_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    // For the current leader: map of log index -> oneshot sender used to
    // notify when a given entry has been committed and applied locally.
    pending_commands: HashMap<u64, oneshot::Sender<()>>,
}

impl RaftNode {
    /// Open (or recover) a node from its data directory. The persisted term
    /// and vote are restored so a restart can never hand out a second vote
    /// in a term it already voted in.
    pub fn new(config: RaftConfig, transport: Arc<dyn RaftTransport>) -> Result<Self, RaftError> {
        config.validate()?;

        let log = Log::new(&config.data_dir)?;
        let hard_state = HardState::load(&config.data_dir)?;
        if hard_state.current_term > 0 {
            info!(
                "Node {} restored term {}, log through index {}",
                config.node_id,
                hard_state.current_term,
                log.last_index()
            );
        }

        let mut state = NodeState::new();
        state.current_term = hard_state.current_term;
        state.voted_for = hard_state.voted_for;

        let peers = config.peers.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let election_timeout = Self::random_election_timeout(&config);

        Ok(Self {
            id: config.node_id.clone(),
            state,
            log,
            hard_state_dirty: false,
            halted: false,
            config,
            peers,
            transport,
            message_sender: None,
            last_election_time: Instant::now(),
            election_timeout,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            lease_duration: Duration::from_millis(heartbeat_interval * 3),
            apply_sender: None,
            pending_commands: HashMap::new(),
        })
    }

    pub fn set_apply_sender(&mut self, sender: mpsc::UnboundedSender<Vec<u8>>) {
        self.apply_sender = Some(sender);
    }

    pub fn set_message_sender(&mut self, sender: mpsc::Sender<RaftMessage>) {
        self.message_sender = Some(sender);
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.role, NodeRole::Leader)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    /// True once this node has gone `election_timeout` without hearing from
    /// a live leader (or granting a vote). Leaders never time out.
    pub fn election_timeout_elapsed(&self) -> bool {
        !self.is_leader() && self.last_election_time.elapsed() >= self.election_timeout
    }

    fn reset_election_timer(&mut self) {
        self.last_election_time = Instant::now();
        self.election_timeout = Self::random_election_timeout(&self.config);
    }

    fn random_election_timeout(config: &RaftConfig) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms =
            rng.random_range(config.election_timeout_min..=config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    fn abort_pending_commands(&mut self) {
        // Dropping the senders will cause any awaiters on the corresponding
        // oneshot::Receiver to observe an error instead of hanging forever.
        self.pending_commands.clear();
    }

    /// Mark the node halted when a storage operation failed in a way that
    /// makes further participation unsafe.
    fn storage_failure(&mut self, e: RaftError) -> RaftError {
        if e.is_fatal() {
            self.halted = true;
            error!("Node {} halting after storage failure: {e}", self.id);
        }
        e
    }

    /// Flush the durable term/vote if it changed. Called before a reply
    /// leaves the node; a reply that promises a vote the disk does not
    /// know about must never be sent.
    fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        if !self.hard_state_dirty {
            return Ok(());
        }
        let hard_state = HardState {
            current_term: self.state.current_term,
            voted_for: self.state.voted_for.clone(),
        };
        match hard_state.save(&self.config.data_dir) {
            Ok(()) => {
                self.hard_state_dirty = false;
                Ok(())
            }
            Err(e) => Err(self.storage_failure(e)),
        }
    }

    pub fn start_election(&mut self) -> Result<(), RaftError> {
        if self.halted {
            return Err(RaftError::Halted);
        }

        self.state.become_candidate(&self.id)?;
        self.hard_state_dirty = true;
        self.reset_election_timer();
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        info!(
            "Node {} starting election for term {}",
            self.id, self.state.current_term
        );

        // The new term and self-vote go to disk before any peer sees them.
        self.persist_hard_state()?;

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.term_at(last_log_index).unwrap_or(0);

        let request = RaftMessage::RequestVote {
            term: self.state.current_term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        self.broadcast_message(request)?;

        // A single-node cluster is its own majority.
        if self.votes_received.len() >= self.config.majority() {
            self.become_leader()?;
        }

        Ok(())
    }

    /// Leader tick: one AppendEntries per peer, carrying everything from
    /// that peer's next_index. Caught-up peers get an empty heartbeat,
    /// lagging ones catch up without waiting for a new proposal.
    pub fn broadcast_append_entries(&mut self) -> Result<(), RaftError> {
        if self.halted {
            return Err(RaftError::Halted);
        }
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }

        for peer_id in self.peers.keys() {
            let next_idx = self.next_index.get(peer_id).copied().unwrap_or(1);
            let prev_log_index = next_idx.saturating_sub(1);
            let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
            let entries = self.log.get_entries(next_idx, None);

            let message = RaftMessage::AppendEntries {
                term: self.state.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            };

            self.send_message_to_peer(peer_id, message)?;
        }

        Ok(())
    }

    /// Propose a command. Returns the log index it was assigned and a
    /// receiver that fires once the entry is committed and applied; the
    /// receiver errors out if leadership is lost before that happens.
    pub fn submit_command(
        &mut self,
        command: Vec<u8>,
    ) -> Result<(u64, oneshot::Receiver<()>), RaftError> {
        if self.halted {
            return Err(RaftError::Halted);
        }
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }

        let log_index = self.append_local(command)?;
        let (tx, rx) = oneshot::channel();
        self.pending_commands.insert(log_index, tx);
        // Update commit index immediately after appending so that single-node
        // clusters (with no peers) can commit entries based on the leader's
        // own log, while multi-node clusters still wait for follower
        // match_index updates.
        self.update_commit_index()?;

        // Replicate to followers
        self.broadcast_append_entries()?;

        Ok((log_index, rx))
    }

    /// Append a command to the leader's own log under the current term.
    /// The entry is on disk when this returns.
    fn append_local(&mut self, command: Vec<u8>) -> Result<u64, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }

        let entry = LogEntry {
            term: self.state.current_term,
            index: self.log.last_index() + 1,
            command,
        };
        self.log.append(entry).map_err(|e| self.storage_failure(e))
    }

    pub fn handle_message(
        &mut self,
        message: RaftMessage,
    ) -> Result<Option<RaftMessage>, RaftError> {
        if self.halted {
            return Err(RaftError::Halted);
        }

        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(term, candidate_id, last_log_index, last_log_term),
            RaftMessage::RequestVoteResponseFromPeer {
                peer_id,
                term,
                vote_granted,
            } => self
                .handle_request_vote_response(peer_id, term, vote_granted)
                .map(|_| None),
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponseFromPeer {
                peer_id,
                term,
                success,
                match_index,
            } => self
                .handle_append_entries_response(peer_id, term, success, match_index)
                .map(|_| None),
            // Plain response variants should not normally be sent into the
            // RaftNode event loop; they are wrapped into *_FromPeer by
            // send_message_to_peer. Handle them as no-ops for robustness.
            RaftMessage::RequestVoteResponse { .. }
            | RaftMessage::AppendEntriesResponse { .. } => Ok(None),
        }
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<Option<RaftMessage>, RaftError> {
        if term > self.state.current_term {
            if self.state.become_follower(term) {
                self.hard_state_dirty = true;
            }
            self.abort_pending_commands();
        }

        let mut vote_granted = false;

        // One vote per term, and only for a candidate whose log is at
        // least as up to date as ours.
        if term >= self.state.current_term
            && (self.state.voted_for.is_none()
                || self.state.voted_for.as_ref() == Some(&candidate_id))
        {
            let our_last_log_index = self.log.last_index();
            let our_last_log_term = self.log.term_at(our_last_log_index).unwrap_or(0);

            if self.state.log_up_to_date(
                last_log_index,
                last_log_term,
                our_last_log_index,
                our_last_log_term,
            ) {
                debug!(
                    "Node {} granting vote to {candidate_id} for term {term}",
                    self.id
                );
                vote_granted = true;
                self.state.voted_for = Some(candidate_id);
                self.hard_state_dirty = true;
                self.reset_election_timer();
            }
        }

        // The vote is durable before the candidate gets to count it.
        self.persist_hard_state()?;

        Ok(Some(RaftMessage::RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        }))
    }

    fn handle_request_vote_response(
        &mut self,
        peer_id: String,
        term: u64,
        vote_granted: bool,
    ) -> Result<(), RaftError> {
        if term > self.state.current_term {
            info!(
                "Node {} stepping down: peer {peer_id} is at term {term}",
                self.id
            );
            if self.state.become_follower(term) {
                self.hard_state_dirty = true;
            }
            self.abort_pending_commands();
            self.persist_hard_state()?;
            return Ok(());
        }

        // A vote from an older term, or one arriving after this election
        // ended, counts for nothing.
        if self.state.role != NodeRole::Candidate || term != self.state.current_term {
            return Ok(());
        }

        if vote_granted {
            self.votes_received.insert(peer_id);
            if self.votes_received.len() >= self.config.majority() {
                self.become_leader()?;
            }
        }

        Ok(())
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<Option<RaftMessage>, RaftError> {
        if term > self.state.current_term {
            if self.state.become_follower(term) {
                self.hard_state_dirty = true;
            }
            self.abort_pending_commands();
        }

        // Reply false if term < currentTerm; our term in the reply makes
        // the stale leader step down.
        if term < self.state.current_term {
            self.persist_hard_state()?;
            return Ok(Some(RaftMessage::AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: self.log.last_index(),
            }));
        }

        // Reset election timeout since we heard from the live leader
        self.reset_election_timer();
        self.state.leader_id = Some(leader_id);

        // A candidate in the same term yields to the leader that won it.
        if self.state.role != NodeRole::Follower {
            self.state.become_follower(term);
            self.abort_pending_commands();
        }

        let entry_count = entries.len() as u64;
        let appended = self.truncate_and_append(prev_log_index, prev_log_term, entries)?;

        let response = if appended {
            self.state
                .advance_commit(leader_commit, self.log.last_index());
            self.apply_committed()?;

            RaftMessage::AppendEntriesResponse {
                term: self.state.current_term,
                success: true,
                match_index: prev_log_index + entry_count,
            }
        } else {
            // No entry matching prev_log_index/prev_log_term. Report how
            // long our log actually is so the leader can rewind next_index
            // in one step instead of probing backwards one at a time.
            RaftMessage::AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: self.log.last_index(),
            }
        };

        self.persist_hard_state()?;
        Ok(Some(response))
    }

    /// Consistency check for an incoming AppendEntries: true when our log
    /// holds `prev_term` at `prev_index`. Index 0 always matches through
    /// the sentinel entry.
    fn match_log(&self, prev_index: u64, prev_term: u64) -> bool {
        self.log.term_at(prev_index) == Some(prev_term)
    }

    /// Reconcile the leader's entries into our log. Entries we already
    /// hold with the same term are left alone (retransmits are harmless);
    /// the first term conflict drops our entire uncommitted suffix before
    /// the leader's entries take its place. Returns false when the
    /// consistency check at `prev_log_index` fails, without touching the
    /// log.
    fn truncate_and_append(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<bool, RaftError> {
        if !self.match_log(prev_log_index, prev_log_term) {
            return Ok(false);
        }

        let mut index = prev_log_index + 1;
        for entry in entries {
            match self.log.term_at(index) {
                Some(existing_term) if existing_term == entry.term => {
                    // Duplicate delivery of an entry we already hold.
                }
                Some(_) => {
                    self.log
                        .truncate(index - 1)
                        .map_err(|e| self.storage_failure(e))?;
                    self.log.append(entry).map_err(|e| self.storage_failure(e))?;
                }
                None => {
                    self.log.append(entry).map_err(|e| self.storage_failure(e))?;
                }
            }
            index += 1;
        }

        Ok(true)
    }

    fn handle_append_entries_response(
        &mut self,
        peer_id: String,
        term: u64,
        success: bool,
        match_index: u64,
    ) -> Result<(), RaftError> {
        if term > self.state.current_term {
            info!(
                "Node {} stepping down: peer {peer_id} is at term {term}",
                self.id
            );
            if self.state.become_follower(term) {
                self.hard_state_dirty = true;
            }
            self.abort_pending_commands();
            self.persist_hard_state()?;
            return Ok(());
        }

        // Only process if we're still the leader and in the same term
        if self.state.role != NodeRole::Leader || term != self.state.current_term {
            return Ok(());
        }

        // Any same-term response, accept or reject, proves this peer still
        // recognizes our leadership. These timestamps back the read lease.
        self.last_ack.insert(peer_id.clone(), Instant::now());

        if success {
            // A duplicate of an older accept can arrive after a newer one;
            // recorded progress only ever moves forward.
            let prior = self.match_index.get(&peer_id).copied().unwrap_or(0);
            let matched = match_index.min(self.log.last_index()).max(prior);
            self.match_index.insert(peer_id.clone(), matched);
            self.next_index.insert(peer_id, matched + 1);

            // Check if we can commit any entries
            self.update_commit_index()?;
        } else {
            // The follower rejected prev_log_index and reported its own
            // last index; rewind next_index to just past it rather than
            // stepping back one entry per round trip. A reject reordered
            // behind an accept never drops below the acknowledged match,
            // which keeps match_index < next_index at all times.
            let floor = self.match_index.get(&peer_id).copied().unwrap_or(0) + 1;
            let next_idx = self.next_index.get(&peer_id).copied().unwrap_or(1);
            let rewound = next_idx
                .saturating_sub(1)
                .min(match_index.saturating_add(1))
                .max(floor);
            self.next_index.insert(peer_id, rewound);
        }

        Ok(())
    }

    fn become_leader(&mut self) -> Result<(), RaftError> {
        self.state.become_leader(&self.id)?;

        info!(
            "Node {} becoming leader for term {}",
            self.id, self.state.current_term
        );

        // Initialize leader state. Acks from an earlier leadership do not
        // carry over to this one.
        self.last_ack.clear();
        let last_log_idx = self.log.last_index();
        for peer_id in self.peers.keys() {
            self.next_index.insert(peer_id.clone(), last_log_idx + 1);
            self.match_index.insert(peer_id.clone(), 0);
        }

        // Announce the new term to the cluster right away
        self.broadcast_append_entries()?;

        Ok(())
    }

    /// True while this leader may answer reads from local state without a
    /// round trip: a majority of the cluster (itself included) has answered
    /// an AppendEntries in the current term within the lease window, so no
    /// newer leader can have been elected in that window.
    pub fn can_serve_read_locally(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let fresh_peers = self
            .peers
            .keys()
            .filter(|peer_id| {
                self.last_ack
                    .get(*peer_id)
                    .is_some_and(|at| at.elapsed() < self.lease_duration)
            })
            .count();
        fresh_peers + 1 >= self.config.majority()
    }

    fn update_commit_index(&mut self) -> Result<(), RaftError> {
        if self.state.role != NodeRole::Leader {
            return Ok(());
        }

        // Find the highest log index replicated on a majority. Missing
        // peers count as 0 so a follower we never heard from cannot be
        // assumed to hold anything.
        let mut match_indices: Vec<u64> = self
            .peers
            .keys()
            .map(|peer_id| self.match_index.get(peer_id).copied().unwrap_or(0))
            .collect();
        match_indices.push(self.log.last_index()); // Include the leader's log
        match_indices.sort_unstable();
        let quorum_index = match_indices[(match_indices.len() - 1) / 2];

        // Only entries from the current term commit by counting replicas;
        // earlier-term entries commit with them.
        if quorum_index > self.state.commit_index
            && self.log.term_at(quorum_index) == Some(self.state.current_term)
        {
            self.state.advance_commit(quorum_index, self.log.last_index());
            self.apply_committed()?;
        }

        Ok(())
    }

    /// Feed every committed-but-unapplied entry to the state machine, in
    /// log order, exactly once. On the leader this also releases clients
    /// waiting on those entries.
    fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.state.last_applied < self.state.commit_index {
            let next = self.state.last_applied + 1;
            let entry = self
                .log
                .get_entry(next)
                .ok_or(RaftError::InvalidLogIndex(next))?;
            self.state.last_applied = next;

            debug!(
                "Node {} applying log entry {next} (term {})",
                self.id, entry.term
            );
            if let Some(tx) = &self.apply_sender {
                if tx.send(entry.command).is_err() {
                    warn!(
                        "State machine receiver dropped; command at index {next} not applied"
                    );
                }
            }

            if self.is_leader() {
                if let Some(tx) = self.pending_commands.remove(&next) {
                    let _ = tx.send(());
                }
            }
        }

        Ok(())
    }

    fn broadcast_message(&self, message: RaftMessage) -> Result<(), RaftError> {
        for peer_id in self.peers.keys() {
            self.send_message_to_peer(peer_id, message.clone())?;
        }

        Ok(())
    }

    /// Fire-and-forget delivery: the RPC runs on its own task and the
    /// response comes back through the message channel as a *_FromPeer
    /// variant. A lost exchange is simply retried by the next tick.
    fn send_message_to_peer(&self, peer_id: &str, message: RaftMessage) -> Result<(), RaftError> {
        if !self.peers.contains_key(peer_id) {
            return Err(RaftError::NetworkError(format!("Unknown peer: {peer_id}")));
        }

        debug!("Sending message to peer {peer_id}: {message:?}");

        let transport = Arc::clone(&self.transport);
        let tx_opt = self.message_sender.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            let response = match transport.send(&peer_id, message).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("RPC to {peer_id} failed: {e}");
                    return;
                }
            };

            let wrapped = match response {
                RaftMessage::RequestVoteResponse { term, vote_granted } => {
                    RaftMessage::RequestVoteResponseFromPeer {
                        peer_id: peer_id.clone(),
                        term,
                        vote_granted,
                    }
                }
                RaftMessage::AppendEntriesResponse {
                    term,
                    success,
                    match_index,
                } => RaftMessage::AppendEntriesResponseFromPeer {
                    peer_id: peer_id.clone(),
                    term,
                    success,
                    match_index,
                },
                other => {
                    error!("Peer {peer_id} answered with a non-response message: {other:?}");
                    return;
                }
            };

            if let Some(tx) = tx_opt {
                if let Err(e) = tx.send(wrapped).await {
                    error!("Failed to forward response from {peer_id}: {e}");
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};

    struct NullTransport;

    #[async_trait]
    impl RaftTransport for NullTransport {
        async fn send(
            &self,
            _peer_id: &str,
            _message: RaftMessage,
        ) -> Result<RaftMessage, RaftError> {
            Err(RaftError::NetworkError("unreachable".to_string()))
        }
    }

    fn test_node(peers: &[&str], tmp: &TempDir) -> RaftNode {
        let mut cfg = RaftConfig::new("n1", tmp.path().to_str().unwrap());
        for peer_id in peers {
            cfg.add_peer(peer_id, "127.0.0.1:0");
        }
        RaftNode::new(cfg, Arc::new(NullTransport)).expect("node")
    }

    fn entry(term: u64, index: u64, payload: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            command: payload.to_vec(),
        }
    }

    #[test]
    fn single_node_election_becomes_leader_and_serves_reads() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&[], &tmp);

        assert_eq!(node.state.current_term, 0);
        assert!(matches!(node.state.role, NodeRole::Follower));

        node.start_election().expect("start_election");

        assert!(node.is_leader());
        assert_eq!(node.state.current_term, 1);
        assert_eq!(node.state.voted_for.as_deref(), Some("n1"));
        assert_eq!(node.state.leader_id.as_deref(), Some("n1"));
        // A cluster of one is its own majority, so the lease holds.
        assert!(node.can_serve_read_locally());
    }

    #[tokio::test]
    async fn election_wins_with_majority_of_three() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);

        node.start_election().expect("start_election");
        assert!(matches!(node.state.role, NodeRole::Candidate));
        assert_eq!(node.votes_received.len(), 1);

        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("response");

        assert!(node.is_leader());
        assert_eq!(node.next_index.get("n2"), Some(&1));
        assert_eq!(node.match_index.get("n3"), Some(&0));
    }

    #[tokio::test]
    async fn duplicate_votes_from_one_peer_count_once() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3", "n4", "n5"], &tmp);

        node.start_election().expect("start_election");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("response");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("response");

        // 2 of 5 voted; majority is 3.
        assert!(matches!(node.state.role, NodeRole::Candidate));

        node.handle_request_vote_response("n3".to_string(), 1, true)
            .expect("response");
        assert!(node.is_leader());
    }

    #[tokio::test]
    async fn stale_vote_response_is_ignored() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);

        node.start_election().expect("round 1");
        node.start_election().expect("round 2");
        assert_eq!(node.state.current_term, 2);

        // A grant from the first round arrives late.
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("response");

        assert!(matches!(node.state.role, NodeRole::Candidate));
        assert_eq!(node.votes_received.len(), 1);
    }

    #[test]
    fn vote_rejected_for_stale_term() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        node.state.current_term = 5;

        let response = node
            .handle_request_vote(3, "n2".to_string(), 10, 3)
            .expect("handled")
            .expect("reply");

        match response {
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                assert_eq!(term, 5);
                assert!(!vote_granted);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(node.state.voted_for.is_none());
    }

    #[test]
    fn one_vote_per_term_but_regrant_to_same_candidate() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["c1", "c2"], &tmp);

        let first = node
            .handle_request_vote(1, "c1".to_string(), 0, 0)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            first,
            RaftMessage::RequestVoteResponse { vote_granted: true, .. }
        ));

        // Second candidate in the same term is refused.
        let second = node
            .handle_request_vote(1, "c2".to_string(), 0, 0)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            second,
            RaftMessage::RequestVoteResponse { vote_granted: false, .. }
        ));

        // A retransmit from the candidate we voted for is granted again.
        let retry = node
            .handle_request_vote(1, "c1".to_string(), 0, 0)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            retry,
            RaftMessage::RequestVoteResponse { vote_granted: true, .. }
        ));
    }

    #[test]
    fn vote_rejected_when_candidate_log_is_behind() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        node.log.append(entry(1, 1, b"a")).expect("append");
        node.log.append(entry(2, 2, b"b")).expect("append");

        // Same last term, shorter log.
        let response = node
            .handle_request_vote(3, "n2".to_string(), 1, 2)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            response,
            RaftMessage::RequestVoteResponse { vote_granted: false, .. }
        ));

        // Longer log but older last term.
        let response = node
            .handle_request_vote(4, "n2".to_string(), 7, 1)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            response,
            RaftMessage::RequestVoteResponse { vote_granted: false, .. }
        ));

        // At least as long with the same last term.
        let response = node
            .handle_request_vote(5, "n2".to_string(), 2, 2)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            response,
            RaftMessage::RequestVoteResponse { vote_granted: true, .. }
        ));
    }

    #[test]
    fn term_and_vote_survive_restart() {
        let tmp = tempdir().expect("tempdir");
        {
            let mut node = test_node(&["c9", "c2"], &tmp);
            let response = node
                .handle_request_vote(7, "c9".to_string(), 0, 0)
                .expect("handled")
                .expect("reply");
            assert!(matches!(
                response,
                RaftMessage::RequestVoteResponse { vote_granted: true, .. }
            ));
        }

        let mut restarted = test_node(&["c9", "c2"], &tmp);
        assert_eq!(restarted.state.current_term, 7);
        assert_eq!(restarted.state.voted_for.as_deref(), Some("c9"));

        // Still refuses a different candidate in the persisted term.
        let response = restarted
            .handle_request_vote(7, "c2".to_string(), 0, 0)
            .expect("handled")
            .expect("reply");
        assert!(matches!(
            response,
            RaftMessage::RequestVoteResponse { vote_granted: false, .. }
        ));
    }

    #[test]
    fn append_entries_rejects_stale_term() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        node.state.current_term = 5;

        let response = node
            .handle_append_entries(4, "n2".to_string(), 0, 0, vec![], 0)
            .expect("handled")
            .expect("reply");

        match response {
            RaftMessage::AppendEntriesResponse { term, success, .. } => {
                assert_eq!(term, 5);
                assert!(!success);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        // A stale leader does not become our leader.
        assert!(node.state.leader_id.is_none());
    }

    #[test]
    fn append_entries_mismatch_reports_log_length() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        node.log.append(entry(1, 1, b"a")).expect("append");

        // Leader assumes we hold 5 entries; we hold 1.
        let response = node
            .handle_append_entries(1, "n2".to_string(), 5, 1, vec![], 0)
            .expect("handled")
            .expect("reply");

        match response {
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
                ..
            } => {
                assert!(!success);
                assert_eq!(match_index, 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn append_entries_truncates_conflicting_suffix() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        node.state.current_term = 3;
        node.log.append(entry(1, 1, b"a")).expect("append");
        node.log.append(entry(1, 2, b"b")).expect("append");
        node.log.append(entry(2, 3, b"c")).expect("append");

        // The new leader's log diverges after index 1.
        let response = node
            .handle_append_entries(
                3,
                "n2".to_string(),
                1,
                1,
                vec![entry(3, 2, b"x"), entry(3, 3, b"y")],
                0,
            )
            .expect("handled")
            .expect("reply");

        match response {
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
                ..
            } => {
                assert!(success);
                assert_eq!(match_index, 3);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(node.log.last_index(), 3);
        assert_eq!(node.log.term_at(2), Some(3));
        assert_eq!(node.log.get_entry(2).map(|e| e.command), Some(b"x".to_vec()));
    }

    #[test]
    fn append_entries_duplicate_delivery_is_harmless() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);

        let batch = vec![entry(1, 1, b"a"), entry(1, 2, b"b")];
        node.handle_append_entries(1, "n2".to_string(), 0, 0, batch.clone(), 0)
            .expect("first delivery");
        node.handle_append_entries(1, "n2".to_string(), 0, 0, batch, 0)
            .expect("retransmit");

        assert_eq!(node.log.last_index(), 2);
        assert_eq!(node.log.get_entry(1).map(|e| e.command), Some(b"a".to_vec()));
    }

    #[test]
    fn follower_applies_committed_entries_in_order() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
        node.set_apply_sender(apply_tx);

        // leader_commit beyond our log is clamped to what we hold.
        node.handle_append_entries(
            1,
            "n2".to_string(),
            0,
            0,
            vec![entry(1, 1, b"a"), entry(1, 2, b"b")],
            5,
        )
        .expect("handled");

        assert_eq!(node.state.commit_index, 2);
        assert_eq!(node.state.last_applied, 2);
        assert_eq!(apply_rx.try_recv().ok(), Some(b"a".to_vec()));
        assert_eq!(apply_rx.try_recv().ok(), Some(b"b".to_vec()));
        assert!(apply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn candidate_yields_to_leader_of_same_term() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);
        node.start_election().expect("start_election");
        assert_eq!(node.state.current_term, 1);

        node.handle_append_entries(1, "n2".to_string(), 0, 0, vec![], 0)
            .expect("handled");

        assert!(matches!(node.state.role, NodeRole::Follower));
        assert_eq!(node.state.leader_id.as_deref(), Some("n2"));
        // The same-term step-down keeps our vote for ourselves.
        assert_eq!(node.state.voted_for.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn leader_commits_on_majority_but_only_own_term() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);

        // An entry inherited from a previous leader, then our own.
        node.log.append(entry(1, 1, b"old")).expect("append");
        node.start_election().expect("round 1");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("elected");
        assert!(node.is_leader());
        node.start_election().expect_err("leader must not restart elections");

        // Force a second term so index 1 is an earlier-term entry.
        node.state.role = NodeRole::Follower;
        node.start_election().expect("round 2");
        node.handle_request_vote_response("n2".to_string(), 2, true)
            .expect("elected");
        assert!(node.is_leader());
        assert_eq!(node.state.current_term, 2);

        // Majority holds index 1, but it is from term 1: no commit.
        node.handle_append_entries_response("n2".to_string(), 2, true, 1)
            .expect("response");
        assert_eq!(node.state.commit_index, 0);

        // A current-term entry reaching the majority commits everything
        // up to and including it.
        let (idx, _rx) = node.submit_command(b"new".to_vec()).expect("submit");
        assert_eq!(idx, 2);
        node.handle_append_entries_response("n2".to_string(), 2, true, 2)
            .expect("response");
        assert_eq!(node.state.commit_index, 2);
        assert_eq!(node.state.last_applied, 2);
    }

    #[tokio::test]
    async fn failed_append_rewinds_next_index_to_follower_hint() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);
        node.start_election().expect("start_election");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("elected");
        node.next_index.insert("n2".to_string(), 10);

        // Follower reports a log of length 3.
        node.handle_append_entries_response("n2".to_string(), 1, false, 3)
            .expect("response");
        assert_eq!(node.next_index.get("n2"), Some(&4));

        // An empty follower pulls next_index all the way down to 1.
        node.handle_append_entries_response("n2".to_string(), 1, false, 0)
            .expect("response");
        assert_eq!(node.next_index.get("n2"), Some(&1));
    }

    #[tokio::test]
    async fn reordered_append_responses_never_regress_progress() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);
        node.start_election().expect("start_election");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("elected");
        for payload in [b"a", b"b", b"c"] {
            node.submit_command(payload.to_vec()).expect("submit");
        }

        node.handle_append_entries_response("n2".to_string(), 1, true, 3)
            .expect("accept");
        assert_eq!(node.match_index.get("n2"), Some(&3));
        assert_eq!(node.next_index.get("n2"), Some(&4));

        // A reject sent before that accept arrives late; it must not pull
        // next_index below the match the accept already proved.
        node.handle_append_entries_response("n2".to_string(), 1, false, 0)
            .expect("late reject");
        assert_eq!(node.match_index.get("n2"), Some(&3));
        assert_eq!(node.next_index.get("n2"), Some(&4));

        // A duplicated older accept is just as inert.
        node.handle_append_entries_response("n2".to_string(), 1, true, 1)
            .expect("duplicate accept");
        assert_eq!(node.match_index.get("n2"), Some(&3));
        assert_eq!(node.next_index.get("n2"), Some(&4));
    }

    #[tokio::test]
    async fn higher_term_response_steps_leader_down() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);
        node.start_election().expect("start_election");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("elected");

        let (_idx, rx) = node.submit_command(b"w".to_vec()).expect("submit");

        node.handle_append_entries_response("n2".to_string(), 9, false, 0)
            .expect("response");

        assert!(matches!(node.state.role, NodeRole::Follower));
        assert_eq!(node.state.current_term, 9);
        // The in-flight proposal is abandoned, not silently dropped.
        assert!(rx.await.is_err());
    }

    #[test]
    fn submit_command_rejected_when_not_leader() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);

        let err = node.submit_command(b"w".to_vec()).unwrap_err();
        assert!(matches!(err, RaftError::NotLeader));
    }

    #[test]
    fn single_node_commit_acks_synchronously() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&[], &tmp);
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
        node.set_apply_sender(apply_tx);

        node.start_election().expect("start_election");
        let (idx, mut rx) = node.submit_command(b"w".to_vec()).expect("submit");

        assert_eq!(idx, 1);
        assert_eq!(node.state.commit_index, 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(apply_rx.try_recv().ok(), Some(b"w".to_vec()));
    }

    #[test]
    fn election_timer_only_fires_after_timeout() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2"], &tmp);

        assert!(!node.election_timeout_elapsed());

        node.last_election_time = Instant::now()
            - Duration::from_millis(node.config.election_timeout_max + 1);
        assert!(node.election_timeout_elapsed());
    }

    #[test]
    fn leaders_never_observe_election_timeout() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&[], &tmp);
        node.start_election().expect("start_election");

        node.last_election_time = Instant::now()
            - Duration::from_millis(node.config.election_timeout_max * 10);
        assert!(!node.election_timeout_elapsed());
    }

    #[test]
    fn can_serve_read_locally_false_when_not_leader_or_no_lease() {
        let tmp = tempdir().expect("tempdir");
        let node = test_node(&[], &tmp);

        assert!(!node.is_leader());
        assert!(!node.can_serve_read_locally());
    }

    #[tokio::test]
    async fn read_lease_requires_fresh_majority_acks() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&["n2", "n3"], &tmp);
        node.start_election().expect("start_election");
        node.handle_request_vote_response("n2".to_string(), 1, true)
            .expect("elected");
        assert!(node.is_leader());

        // Leader, but no peer has answered in this term yet.
        assert!(!node.can_serve_read_locally());

        // One ack plus the leader itself is a majority of three.
        node.handle_append_entries_response("n2".to_string(), 1, true, 0)
            .expect("response");
        assert!(node.can_serve_read_locally());

        // Once that ack ages past the lease window the right lapses, even
        // though the node still holds the Leader role.
        node.last_ack.insert(
            "n2".to_string(),
            Instant::now() - node.lease_duration - Duration::from_millis(1),
        );
        assert!(!node.can_serve_read_locally());
    }

    #[tokio::test]
    async fn abort_pending_commands_cancels_waiters() {
        let tmp = tempdir().expect("tempdir");
        let mut node = test_node(&[], &tmp);

        let (tx, rx) = oneshot::channel::<()>();
        node.pending_commands.insert(1, tx);

        node.abort_pending_commands();

        assert!(rx.await.is_err());
    }
}
