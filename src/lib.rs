// Consensus core: node state machine, elections, replication, durable log
pub mod raft;

// Replicated key-value state machine fed by committed log entries
pub mod store;

// gRPC plumbing: node-to-node consensus RPCs and the client-facing KV API
pub mod network;

// Public exports
pub use raft::{Raft, RaftConfig, RaftError, RaftNode};
pub use store::{Command, KvStore};
