use std::collections::HashMap;

use bincode::config;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A state machine command, as carried opaquely in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Command {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::encode_to_vec(self, config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (command, _) = bincode::decode_from_slice(bytes, config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(command)
    }
}

/// The replicated key-value state machine.
///
/// Commands reach `apply` only after they are committed, in log order, so
/// every replica that has applied the same prefix holds the same map.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Put { key, value } => {
                self.data.insert(key, value);
            }
            Command::Delete { key } => {
                self.data.remove(&key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
