use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not a leader")]
    NotLeader,

    #[error("Invalid transition: {0}")]
    InvalidTransition(&'static str),

    #[error("Invalid log index: {0}")]
    InvalidLogIndex(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Node halted after storage failure")]
    Halted,

    #[error("Timeout")]
    Timeout,
}

impl RaftError {
    /// Storage failures are the one fatal condition at this layer: a node
    /// that cannot persist must stop participating rather than risk
    /// acknowledging state it may lose.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::IoError(_) | RaftError::SerializationError(_) | RaftError::Halted
        )
    }
}
