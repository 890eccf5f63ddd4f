//! Health manager
//!
//! Probes every backend at a fixed cadence and persists the local
//! judgment per router instance. The *effective* health of a storage is
//! decided across router instances: healthy only when a strict majority
//! of the active routers saw it alive within the freshness window, so a
//! single partitioned router cannot trigger needless failovers.

use crate::common::{HealthConfig, Result};
use crate::router::backend::NodeManager;
use crate::store::PlacementStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct HealthManager {
    store: Arc<PlacementStore>,
    nodes: Arc<NodeManager>,
    router_name: String,
    config: HealthConfig,
}

impl HealthManager {
    pub fn new(
        store: Arc<PlacementStore>,
        nodes: Arc<NodeManager>,
        router_name: String,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            router_name,
            config,
        }
    }

    /// Probe every registered backend once and persist the results.
    pub async fn probe_once(&self) -> Result<()> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        for (virtual_storage, storage, client) in self.nodes.entries() {
            let reachable = matches!(
                tokio::time::timeout(timeout, client.ping()).await,
                Ok(Ok(()))
            );
            if !reachable {
                tracing::debug!(%virtual_storage, %storage, "backend probe failed");
            }
            self.store.record_health(
                &self.router_name,
                &virtual_storage,
                &storage,
                reachable,
                Utc::now(),
            )?;
        }
        Ok(())
    }

    /// Effectively healthy storages of one virtual storage.
    pub fn healthy_storages(&self, virtual_storage: &str) -> Result<HashSet<String>> {
        self.store.healthy_storages(
            virtual_storage,
            Duration::from_secs(self.config.freshness_secs),
            Utc::now(),
        )
    }

    /// Probe loop; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.probe_once().await {
                tracing::error!("health probe sweep failed: {}", e);
            }
        }
    }
}
