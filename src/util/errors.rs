use std::io;

use thiserror::Error;

use crate::raft::types::NodeId;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Log inconsistency detected")]
    LogInconsistency,

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
