use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::raft::types::NodeId;
use crate::util::errors::{RaftError, Result};

/// A single member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub ip: String,
    pub port: String,
}

impl Server {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    /// `ip:port`, the key used by the cluster directory
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Unique identifier for this node
    pub node_id: NodeId,

    /// Minimum election timeout in milliseconds (e.g., 150)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (e.g., 300)
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds (e.g., 50)
    /// Should be much less than election timeout
    pub heartbeat_interval_ms: u64,

    /// Upper bound for a single outbound RPC
    pub rpc_timeout_ms: u64,

    /// Directory for persistent storage
    pub data_dir: PathBuf,
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }

        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat_interval must be less than election_timeout_min".to_string());
        }

        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return Err(
                "rpc_timeout must be positive and less than election_timeout_min".to_string(),
            );
        }

        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Every server in the cluster, keyed by numeric node id
    pub servers: BTreeMap<NodeId, Server>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Config {
    /// Load the cluster configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            RaftError::InvalidConfig(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(contents)
            .map_err(|e| RaftError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Select the local node and check the whole configuration
    pub fn with_node_id(mut self, node_id: NodeId) -> Result<Self> {
        self.raft.node_id = node_id;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate().map_err(RaftError::InvalidConfig)?;

        if self.servers.is_empty() {
            return Err(RaftError::InvalidConfig("no servers configured".to_string()));
        }

        if !self.servers.contains_key(&self.raft.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} is not listed in servers",
                self.raft.node_id
            )));
        }

        Ok(())
    }

    pub fn local_server(&self) -> Option<&Server> {
        self.servers.get(&self.raft.node_id)
    }

    /// Every configured server except this node
    pub fn peers(&self) -> Vec<(NodeId, Server)> {
        self.servers
            .iter()
            .filter(|(id, _)| **id != self.raft.node_id)
            .map(|(id, server)| (*id, server.clone()))
            .collect()
    }
}
