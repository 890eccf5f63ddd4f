//! Backend node seam
//!
//! The wire protocol to backends is out of scope; everything the router
//! needs from a storage node goes through [`BackendNode`]. Production
//! wiring plugs a transport client in here; tests plug in an in-process
//! double.

use crate::common::{Error, Result};
use crate::router::voting::VoterHandle;
use crate::store::ChangeType;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrent RPC streams per backend connection pool
const DEFAULT_STREAMS_PER_STORAGE: usize = 16;

/// A request rewritten for one participant: the virtual-storage routing
/// key is replaced with the physical storage name and on-disk path.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub storage: String,
    pub replica_path: String,
    pub operation: String,
    pub payload: Bytes,
    /// Present on mutators; lets the backend synchronize mid-RPC
    pub vote: Option<VoterHandle>,
}

#[derive(Debug, Clone)]
pub struct NodeResponse {
    pub payload: Bytes,
}

/// One backend storage node.
#[async_trait]
pub trait BackendNode: Send + Sync {
    /// Forward a client RPC. Mutators carry a vote handle the backend
    /// uses at its synchronization points.
    async fn forward(&self, req: NodeRequest) -> Result<NodeResponse>;

    /// Bring the local replica to the source's state (create or update).
    async fn replicate(&self, source_storage: &str, replica_path: &str) -> Result<()>;

    /// Remove the on-disk repository. Removing a missing repository
    /// succeeds.
    async fn remove_repository(&self, replica_path: &str) -> Result<()>;

    /// Atomic on-disk rename.
    async fn rename_repository(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Run a housekeeping task that does not affect the generation.
    async fn housekeeping(&self, replica_path: &str, task: ChangeType) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}

struct NodeHandle {
    client: Arc<dyn BackendNode>,
    address: String,
    streams: Arc<Semaphore>,
}

/// A checked-out backend client plus its stream permit. The permit is
/// released when the slot drops, closing the stream slot.
pub struct NodeSlot {
    pub client: Arc<dyn BackendNode>,
    _permit: OwnedSemaphorePermit,
}

/// Registry of backend nodes keyed by `(virtual storage, storage)`,
/// with a per-storage cap on concurrent streams.
#[derive(Default)]
pub struct NodeManager {
    nodes: HashMap<(String, String), NodeHandle>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        virtual_storage: &str,
        storage: &str,
        address: &str,
        client: Arc<dyn BackendNode>,
    ) {
        self.nodes.insert(
            (virtual_storage.to_string(), storage.to_string()),
            NodeHandle {
                client,
                address: address.to_string(),
                streams: Arc::new(Semaphore::new(DEFAULT_STREAMS_PER_STORAGE)),
            },
        );
    }

    /// Check out a stream slot for a storage; suspends when the pool is
    /// exhausted.
    pub async fn checkout(&self, virtual_storage: &str, storage: &str) -> Result<NodeSlot> {
        let handle = self
            .nodes
            .get(&(virtual_storage.to_string(), storage.to_string()))
            .ok_or_else(|| {
                Error::Unavailable(format!(
                    "no backend registered for {}/{}",
                    virtual_storage, storage
                ))
            })?;
        let permit = handle
            .streams
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("backend stream pool closed".into()))?;
        Ok(NodeSlot {
            client: handle.client.clone(),
            _permit: permit,
        })
    }

    pub fn address(&self, virtual_storage: &str, storage: &str) -> Option<&str> {
        self.nodes
            .get(&(virtual_storage.to_string(), storage.to_string()))
            .map(|h| h.address.as_str())
    }

    /// Every registered `(virtual storage, storage)` pair.
    pub fn entries(&self) -> Vec<(String, String, Arc<dyn BackendNode>)> {
        let mut entries: Vec<(String, String, Arc<dyn BackendNode>)> = self
            .nodes
            .iter()
            .map(|((vs, storage), handle)| (vs.clone(), storage.clone(), handle.client.clone()))
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }
}
