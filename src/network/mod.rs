use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("gRPC error: {0}")]
    GrpcError(#[from] Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

pub mod client;
pub mod server;

pub mod proto {
    tonic::include_proto!("raft");
}

pub use client::{GrpcTransport, KvClient, RaftClient};
pub use server::{KvServer, RaftServer};
