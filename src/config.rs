//! Engine configuration, loadable from TOML or built explicitly in tests.

use crate::error::Result;
use crate::types::{ClusterName, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    pub node_id: NodeId,
    pub bind_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub data_dir: PathBuf,

    /// Base election timeout; the effective timeout is drawn uniformly from
    /// `[base, 2 * base)` on every election-timer reset.
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub tick_interval_ms: u64,

    pub max_entries_per_append: usize,
    pub snapshot_threshold: u64,
    pub max_log_entries: u64,

    pub command_queue_capacity: usize,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "default-cluster".to_string(),
            node_id: 1,
            bind_addr: "0.0.0.0:9500".parse().unwrap(),
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            election_timeout_ms: 1000,
            heartbeat_interval_ms: 100,
            tick_interval_ms: 50,
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
            max_log_entries: 1_000,
            command_queue_capacity: 1024,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            max_reconnect_attempts: 10,
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 30_000,
        }
    }
}

impl Config {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_and_defaults() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(node_id) = std::env::var("RAFT_NODE_ID") {
            config.node_id = node_id
                .parse()
                .map_err(|_| crate::error::RaftError::InvalidConfig(format!("RAFT_NODE_ID={node_id} is not a valid node id")))?;
        }
        if let Ok(bind_addr) = std::env::var("RAFT_BIND_ADDR") {
            config.bind_addr = bind_addr
                .parse()
                .map_err(|_| crate::error::RaftError::InvalidConfig(format!("RAFT_BIND_ADDR={bind_addr} is not a valid socket address")))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ClusterName::new(self.cluster_name.clone())
            .map_err(|e| crate::error::RaftError::InvalidConfig(e.to_string()))?;
        if self.node_id == 0 {
            return Err(crate::error::RaftError::InvalidConfig(
                "node_id 0 is reserved".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(crate::error::RaftError::InvalidConfig(
                "heartbeat_interval_ms must be smaller than election_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        let base = Duration::from_millis(self.election_timeout_ms);
        (base, base * 2)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_reserved_node_id() {
        let mut config = Config::default();
        config.node_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_ge_election_timeout() {
        let mut config = Config::default();
        config.heartbeat_interval_ms = config.election_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_toml_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        let loaded = Config::from_toml_file(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.cluster_name, config.cluster_name);
    }
}
