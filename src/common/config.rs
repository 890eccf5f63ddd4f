//! Configuration for helmsman components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Router instance name (unique per router process)
    pub router_name: String,

    /// Bind address for the HTTP admin API
    pub bind_addr: SocketAddr,

    /// RocksDB path for the placement store
    pub db_path: PathBuf,

    /// Virtual storages served by this router
    pub virtual_storages: Vec<VirtualStorageConfig>,

    /// Vote coordinator settings
    #[serde(default)]
    pub vote: VoteConfig,

    /// Replication scheduler settings
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Health manager settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Failover controller settings
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One logical storage name exposed to clients, backed by physical storages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualStorageConfig {
    /// Client-visible name
    pub name: String,

    /// Backend nodes, in configuration order
    pub nodes: Vec<NodeConfig>,

    /// Replicas per repository created on this virtual storage
    #[serde(default = "default_replication_factor")]
    pub default_replication_factor: usize,

    /// Vote threshold override; defaults to a strict majority plus one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vote_quorum: Option<usize>,
}

fn default_replication_factor() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Physical storage name
    pub storage: String,

    /// Backend address
    pub address: String,
}

/// Vote coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteConfig {
    /// Deadline for the prepared phase
    #[serde(default = "default_prepared_timeout")]
    pub prepared_timeout_secs: u64,

    /// Deadline for the committed phase
    #[serde(default = "default_committed_timeout")]
    pub committed_timeout_secs: u64,

    /// How long a finished transaction stays visible to stragglers
    #[serde(default = "default_transaction_grace")]
    pub grace_secs: u64,
}

fn default_prepared_timeout() -> u64 {
    10
}
fn default_committed_timeout() -> u64 {
    60
}
fn default_transaction_grace() -> u64 {
    30
}

impl VoteConfig {
    pub fn phase_timeout(&self, committed: bool) -> Duration {
        if committed {
            Duration::from_secs(self.committed_timeout_secs)
        } else {
            Duration::from_secs(self.prepared_timeout_secs)
        }
    }
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            prepared_timeout_secs: default_prepared_timeout(),
            committed_timeout_secs: default_committed_timeout(),
            grace_secs: default_transaction_grace(),
        }
    }
}

/// Replication scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Attempts before a job is marked dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay (milliseconds); doubled per attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Retry delay cap (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Lease duration for claimed jobs
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Poll interval when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_lease_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    10
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            lease_secs: default_lease_secs(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Health manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe cadence
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Window within which a health report counts
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,

    /// Per-probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_health_interval() -> u64 {
    3
}
fn default_freshness() -> u64 {
    10
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            freshness_secs: default_freshness(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Failover controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Evaluation cadence
    #[serde(default = "default_failover_interval")]
    pub interval_secs: u64,

    /// Disable to pin primaries (operator escape hatch)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_failover_interval() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_failover_interval(),
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.router_name.is_empty() {
            return Err(crate::Error::InvalidConfig("router_name is required".into()));
        }
        if self.virtual_storages.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "at least one virtual storage is required".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for vs in &self.virtual_storages {
            if vs.name.is_empty() {
                return Err(crate::Error::InvalidConfig(
                    "virtual storage name is required".into(),
                ));
            }
            if !seen.insert(vs.name.clone()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "duplicate virtual storage: {}",
                    vs.name
                )));
            }
            if vs.nodes.is_empty() {
                return Err(crate::Error::InvalidConfig(format!(
                    "virtual storage {} has no nodes",
                    vs.name
                )));
            }
            let mut storages = std::collections::HashSet::new();
            for node in &vs.nodes {
                if !storages.insert(node.storage.clone()) {
                    return Err(crate::Error::InvalidConfig(format!(
                        "duplicate storage {} in virtual storage {}",
                        node.storage, vs.name
                    )));
                }
            }
            if vs.default_replication_factor == 0
                || vs.default_replication_factor > vs.nodes.len()
            {
                return Err(crate::Error::InvalidConfig(format!(
                    "replication factor {} out of range for virtual storage {} with {} nodes",
                    vs.default_replication_factor,
                    vs.name,
                    vs.nodes.len()
                )));
            }
            if let Some(q) = vs.vote_quorum {
                if q == 0 || q > vs.nodes.len() {
                    return Err(crate::Error::InvalidConfig(format!(
                        "vote quorum {} out of range for virtual storage {}",
                        q, vs.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Storage names per virtual storage, in configuration order
    pub fn storage_names(&self) -> std::collections::HashMap<String, Vec<String>> {
        self.virtual_storages
            .iter()
            .map(|vs| {
                (
                    vs.name.clone(),
                    vs.nodes.iter().map(|n| n.storage.clone()).collect(),
                )
            })
            .collect()
    }

    pub fn virtual_storage(&self, name: &str) -> Option<&VirtualStorageConfig> {
        self.virtual_storages.iter().find(|vs| vs.name == name)
    }
}

impl VirtualStorageConfig {
    /// Vote threshold for a participant set of the given size.
    /// Defaults to `ceil(n / 2) + 1`, capped at the set size.
    pub fn quorum(&self, participants: usize) -> usize {
        match self.vote_quorum {
            Some(q) => q.min(participants),
            None => ((participants + 1) / 2 + 1).min(participants),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            router_name: "router-1".into(),
            bind_addr: "127.0.0.1:5000".parse().unwrap(),
            db_path: PathBuf::from("./router-data"),
            virtual_storages: vec![VirtualStorageConfig {
                name: "vs1".into(),
                nodes: vec![
                    NodeConfig {
                        storage: "st-1".into(),
                        address: "http://localhost:6000".into(),
                    },
                    NodeConfig {
                        storage: "st-2".into(),
                        address: "http://localhost:6001".into(),
                    },
                    NodeConfig {
                        storage: "st-3".into(),
                        address: "http://localhost:6002".into(),
                    },
                ],
                default_replication_factor: 3,
                vote_quorum: None,
            }],
            vote: VoteConfig::default(),
            replication: ReplicationConfig::default(),
            health: HealthConfig::default(),
            failover: FailoverConfig::default(),
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_replication_factor() {
        let mut cfg = sample();
        cfg.virtual_storages[0].default_replication_factor = 4;
        assert!(cfg.validate().is_err());

        cfg.virtual_storages[0].default_replication_factor = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_storage() {
        let mut cfg = sample();
        cfg.virtual_storages[0].nodes[1].storage = "st-1".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_quorum_default() {
        let vs = sample().virtual_storages[0].clone();
        assert_eq!(vs.quorum(1), 1);
        assert_eq!(vs.quorum(2), 2);
        assert_eq!(vs.quorum(3), 3);
        assert_eq!(vs.quorum(4), 3);
        assert_eq!(vs.quorum(5), 4);
    }

    #[test]
    fn test_quorum_override() {
        let mut vs = sample().virtual_storages[0].clone();
        vs.vote_quorum = Some(3);
        assert_eq!(vs.quorum(3), 3);
        assert_eq!(vs.quorum(2), 2);
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = sample();
        cfg.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.router_name, cfg.router_name);
        assert_eq!(loaded.virtual_storages.len(), 1);
        assert_eq!(loaded.virtual_storages[0].nodes.len(), 3);
    }
}
