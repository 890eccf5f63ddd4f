//! Failover controller
//!
//! A per-repository state machine driven by health ticks and generation
//! data. When the primary is unhealthy or behind, the controller elects
//! the lexicographically smallest assigned storage that is healthy and
//! fully up to date, so independent controllers reach the same answer.
//! The decision runs against a snapshot and lands through a
//! compare-and-set; no store lock is held while deciding.

use crate::common::{FailoverConfig, Metrics, Result, METRICS};
use crate::router::health::HealthManager;
use crate::store::PlacementStore;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of one repository's primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryState {
    /// Primary healthy and fully up to date
    Stable(String),
    /// Primary unhealthy; no eligible successor yet
    Demoting(String),
    /// No primary and no eligible candidate
    Electing,
    /// Primary healthy but behind; mutators fail until repair
    ReadOnly(String),
}

pub struct FailoverController {
    store: Arc<PlacementStore>,
    health: Arc<HealthManager>,
    config: FailoverConfig,
}

impl FailoverController {
    pub fn new(
        store: Arc<PlacementStore>,
        health: Arc<HealthManager>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            store,
            health,
            config,
        }
    }

    /// Evaluate one repository, promoting a new primary if needed.
    pub fn evaluate(&self, repository_id: u64) -> Result<PrimaryState> {
        let record = self.store.get_repository(repository_id)?;
        let healthy = self.health.healthy_storages(&record.virtual_storage)?;
        let details = self.store.repository_details(repository_id, &healthy)?;

        let current = details.primary.clone();
        let current_detail = current
            .as_ref()
            .and_then(|p| details.replicas.iter().find(|r| &r.storage == p));

        // A valid primary stays; stability beats rebalancing.
        if let Some(detail) = current_detail {
            if detail.valid_primary {
                return Ok(PrimaryState::Stable(detail.storage.clone()));
            }
        }

        // Candidates are already storage-sorted; the first wins on every
        // controller that sees the same snapshot.
        let candidate = details
            .replicas
            .iter()
            .find(|r| r.valid_primary)
            .map(|r| r.storage.clone());

        if let Some(new_primary) = candidate {
            let swapped = self.store.set_primary(
                repository_id,
                current.as_deref(),
                Some(new_primary.clone()),
            )?;
            if swapped {
                Metrics::incr(&METRICS.primary_elections);
                tracing::info!(
                    repository_id,
                    old = current.as_deref().unwrap_or("none"),
                    new = %new_primary,
                    "promoted new primary"
                );
                return Ok(PrimaryState::Stable(new_primary));
            }
            // Another router won the race; report what is stored now.
            let record = self.store.get_repository(repository_id)?;
            return Ok(match record.primary {
                Some(p) => PrimaryState::Stable(p),
                None => PrimaryState::Electing,
            });
        }

        Ok(match current_detail {
            Some(detail) if detail.healthy => PrimaryState::ReadOnly(detail.storage.clone()),
            Some(detail) => PrimaryState::Demoting(detail.storage.clone()),
            None => PrimaryState::Electing,
        })
    }

    /// Evaluate every repository once. Returns the promotions made.
    pub fn tick(&self) -> Result<Vec<(u64, String)>> {
        let mut promotions = Vec::new();
        for repository_id in self.store.repository_ids() {
            let before = self.store.get_repository(repository_id)?.primary;
            match self.evaluate(repository_id) {
                Ok(PrimaryState::Stable(storage)) if Some(&storage) != before.as_ref() => {
                    promotions.push((repository_id, storage));
                }
                Ok(_) => {}
                Err(crate::common::Error::NotFound(_)) => {}
                Err(e) => {
                    tracing::error!(repository_id, "failover evaluation failed: {}", e);
                }
            }
        }
        Ok(promotions)
    }

    /// Tick loop; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("failover disabled, primaries are pinned");
            return;
        }
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick() {
                tracing::error!("failover sweep failed: {}", e);
            }
        }
    }
}
