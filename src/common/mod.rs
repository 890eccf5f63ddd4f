//! Common utilities and types shared across helmsman

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{
    Config, FailoverConfig, HealthConfig, NodeConfig, ReplicationConfig, VirtualStorageConfig,
    VoteConfig,
};
pub use context::{CancellationSource, ContextValue, RequestContext};
pub use error::{Error, Result};
pub use hash::{blake3_hash, derive_replica_path, select_storages, vote_hash, RefUpdate};
pub use metrics::{Metrics, METRICS};
pub use utils::{backoff_delay, retry_with_backoff, timestamp_now, validate_relative_path};
