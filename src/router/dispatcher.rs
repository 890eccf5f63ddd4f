//! Router / dispatcher
//!
//! For each call: classify by operation name, resolve the replica set
//! from the placement store filtered by effective health, open one
//! stream per participant with the routing key rewritten to the
//! backend-local path, run the vote round for mutators, aggregate the
//! per-replica outcomes, record new generations and enqueue repair jobs
//! for replicas that fell behind.

use crate::common::{
    derive_replica_path, validate_relative_path, Config, Error, Metrics, RequestContext, Result,
    METRICS,
};
use crate::router::backend::{NodeManager, NodeRequest, NodeResponse};
use crate::router::health::HealthManager;
use crate::router::registry::{OperationRegistry, RpcType};
use crate::router::voting::{TransactionRegistry, Voter};
use crate::store::{
    ChangeType, CreateRepository, EnqueueOutcome, NewJob, PlacementStore, RepositoryRecord,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// A typed RPC frame with its virtual-storage routing key
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub virtual_storage: String,
    pub relative_path: String,
    pub operation: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub payload: Bytes,
    pub repository_id: u64,
}

pub struct Dispatcher {
    config: Arc<Config>,
    store: Arc<PlacementStore>,
    nodes: Arc<NodeManager>,
    transactions: Arc<TransactionRegistry>,
    health: Arc<HealthManager>,
    registry: OperationRegistry,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        store: Arc<PlacementStore>,
        nodes: Arc<NodeManager>,
        transactions: Arc<TransactionRegistry>,
        health: Arc<HealthManager>,
    ) -> Self {
        Self {
            config,
            store,
            nodes,
            transactions,
            health,
            registry: OperationRegistry::default(),
        }
    }

    pub async fn dispatch(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        Metrics::incr(&METRICS.rpcs_total);
        validate_relative_path(&req.relative_path)?;
        let rpc_type = self.registry.classify(&req.operation)?;

        tracing::debug!(
            virtual_storage = %req.virtual_storage,
            relative_path = %req.relative_path,
            operation = %req.operation,
            ?rpc_type,
            "dispatching"
        );

        match rpc_type {
            RpcType::Accessor => self.accessor(ctx, req).await,
            RpcType::Mutator => self.mutator(ctx, req).await,
            RpcType::Maintenance => self.maintenance(ctx, req).await,
            RpcType::RepositoryCreation => self.creation(ctx, req).await,
            RpcType::RepositoryDeletion => self.deletion(req).await,
            RpcType::RepositoryRename => self.rename(req).await,
        }
    }

    /// Route a read to one up-to-date healthy replica, preferring the
    /// primary, then assigned secondaries, then anything up to date.
    async fn accessor(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        let record = self
            .store
            .get_repository_by_path(&req.virtual_storage, &req.relative_path)?;
        let healthy = self.health.healthy_storages(&req.virtual_storage)?;
        let replicas = self.store.get_replicas(record.repository_id)?;
        let max = replicas.iter().filter_map(|r| r.generation).max();

        let readable = |storage: &str| {
            replicas.iter().any(|r| {
                r.storage == storage
                    && r.generation.is_some()
                    && r.generation == max
                    && healthy.contains(storage)
            })
        };

        let storage = record
            .primary
            .clone()
            .filter(|p| readable(p))
            .or_else(|| {
                replicas
                    .iter()
                    .find(|r| r.assigned && readable(&r.storage))
                    .map(|r| r.storage.clone())
            })
            .or_else(|| {
                replicas
                    .iter()
                    .find(|r| readable(&r.storage))
                    .map(|r| r.storage.clone())
            })
            .ok_or_else(|| {
                Error::Unavailable(format!(
                    "no up-to-date healthy replica for {}/{}",
                    req.virtual_storage, req.relative_path
                ))
            })?;

        let response = self
            .forward_to(
                ctx,
                &req.virtual_storage,
                NodeRequest {
                    storage,
                    replica_path: record.replica_path.clone(),
                    operation: req.operation,
                    payload: req.payload,
                    vote: None,
                },
            )
            .await?;
        Ok(ClientResponse {
            payload: response.payload,
            repository_id: record.repository_id,
        })
    }

    /// Run a mutator across the primary and every up-to-date healthy
    /// assigned secondary, under the vote protocol.
    async fn mutator(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        let record = self
            .store
            .get_repository_by_path(&req.virtual_storage, &req.relative_path)?;
        let healthy = self.health.healthy_storages(&req.virtual_storage)?;
        let replicas = self.store.get_replicas(record.repository_id)?;
        let max = replicas.iter().filter_map(|r| r.generation).max();

        let primary = record.primary.clone().ok_or_else(|| {
            Error::Unavailable(format!(
                "repository {}/{} has no primary",
                req.virtual_storage, req.relative_path
            ))
        })?;
        if !healthy.contains(&primary) {
            Metrics::incr(&METRICS.mutators_failed);
            return Err(Error::Unavailable(format!(
                "primary {} is unhealthy",
                primary
            )));
        }
        let primary_generation = replicas
            .iter()
            .find(|r| r.storage == primary)
            .and_then(|r| r.generation)
            .ok_or_else(|| {
                Error::Unavailable(format!("primary {} has no replica yet", primary))
            })?;
        if Some(primary_generation) != max {
            Metrics::incr(&METRICS.mutators_failed);
            // Behind a healthy up-to-date replica the repository is
            // read-only until repaired; with none it is unavailable.
            let available = replicas.iter().any(|r| {
                r.assigned && healthy.contains(&r.storage) && r.generation == max
            });
            return Err(if available {
                Error::FailedPrecondition(format!(
                    "repository is read-only: primary {} is behind by {} changes",
                    primary,
                    max.unwrap_or(0).saturating_sub(primary_generation)
                ))
            } else {
                Error::Unavailable(format!(
                    "no assigned replica of {}/{} is up to date and healthy",
                    req.virtual_storage, req.relative_path
                ))
            });
        }

        let secondaries: Vec<String> = replicas
            .iter()
            .filter(|r| {
                r.storage != primary
                    && r.assigned
                    && healthy.contains(&r.storage)
                    && r.generation == Some(primary_generation)
            })
            .map(|r| r.storage.clone())
            .collect();

        let participants: Vec<String> = std::iter::once(primary.clone())
            .chain(secondaries.iter().cloned())
            .collect();
        let results = self
            .run_voted_round(ctx, &req, &record.replica_path, &primary, &participants)
            .await?;

        self.settle_mutator(
            &record,
            &primary,
            primary_generation,
            &secondaries,
            &replicas
                .iter()
                .filter(|r| r.assigned)
                .map(|r| r.storage.clone())
                .collect::<Vec<_>>(),
            results,
        )
    }

    /// Create a repository on a freshly chosen set of healthy storages.
    async fn creation(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        let vs_config = self
            .config
            .virtual_storage(&req.virtual_storage)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown virtual storage: {}",
                    req.virtual_storage
                ))
            })?;
        let repository_id = self
            .store
            .reserve_repository_id(&req.virtual_storage, &req.relative_path)?;
        let replica_path = derive_replica_path(repository_id);

        let healthy = self.health.healthy_storages(&req.virtual_storage)?;
        let mut healthy: Vec<String> = healthy.into_iter().collect();
        healthy.sort();
        if healthy.is_empty() {
            return Err(Error::NoHealthyStorages);
        }

        let replication_factor = vs_config.default_replication_factor;
        let participants = crate::common::select_storages(
            &req.relative_path,
            &healthy,
            replication_factor,
        );
        let primary = participants[0].clone();
        let secondaries: Vec<String> = participants[1..].to_vec();

        // Top the assignment set up to the replication factor with
        // deterministically chosen unhealthy storages; repair jobs will
        // create those replicas once they recover.
        let mut fill: Vec<String> = Vec::new();
        if participants.len() < replication_factor {
            let chosen: HashSet<&String> = participants.iter().collect();
            fill = self
                .store
                .configured_storages(&req.virtual_storage)?
                .iter()
                .filter(|s| !chosen.contains(s))
                .take(replication_factor - participants.len())
                .cloned()
                .collect();
        }

        let mut results = self
            .run_voted_round(ctx, &req, &replica_path, &primary, &participants)
            .await?;

        let primary_result = results
            .remove(&primary)
            .ok_or_else(|| Error::Internal("primary stream vanished".into()))?;
        let response = match primary_result {
            Err(e) => {
                Metrics::incr(&METRICS.mutators_failed);
                return Err(e);
            }
            Ok(response) => response,
        };

        let updated: Vec<String> = secondaries
            .iter()
            .filter(|s| matches!(results.get(*s), Some(Ok(_))))
            .cloned()
            .collect();
        let failed: Vec<String> = secondaries
            .iter()
            .filter(|s| !matches!(results.get(*s), Some(Ok(_))))
            .cloned()
            .collect();
        let outdated: Vec<String> = failed.iter().chain(fill.iter()).cloned().collect();

        let record = RepositoryRecord {
            repository_id,
            virtual_storage: req.virtual_storage.clone(),
            relative_path: req.relative_path.clone(),
            replica_path: replica_path.clone(),
            primary: Some(primary.clone()),
        };
        self.store.create_repository(CreateRepository {
            repository_id,
            virtual_storage: req.virtual_storage.clone(),
            relative_path: req.relative_path.clone(),
            replica_path,
            primary: Some(primary.clone()),
            updated_secondaries: updated,
            outdated_secondaries: outdated.clone(),
            store_assignments: true,
            force: false,
        })?;

        for target in &outdated {
            self.enqueue_repair(&record, ChangeType::Create, Some(&primary), target, None);
        }

        Ok(ClientResponse {
            payload: response.payload,
            repository_id,
        })
    }

    /// Remove the placement record and enqueue tombstones for every
    /// storage that held a replica; the scheduler performs the disk
    /// deletions.
    async fn deletion(&self, req: ClientRequest) -> Result<ClientResponse> {
        let record = self
            .store
            .get_repository_by_path(&req.virtual_storage, &req.relative_path)?;
        let (repository_id, storages) = self
            .store
            .delete_repository(&req.virtual_storage, &req.relative_path)?;

        for target in &storages {
            self.enqueue_repair(&record, ChangeType::Delete, None, target, None);
        }

        Ok(ClientResponse {
            payload: Bytes::new(),
            repository_id,
        })
    }

    /// Change the client-visible path. The payload carries the new
    /// relative path. On-disk renames are only needed for repositories
    /// whose replica path tracks the client path.
    async fn rename(&self, req: ClientRequest) -> Result<ClientResponse> {
        let new_path = String::from_utf8(req.payload.to_vec())
            .map_err(|_| Error::InvalidArgument("rename target is not valid UTF-8".into()))?;
        validate_relative_path(&new_path)?;

        let record = self
            .store
            .get_repository_by_path(&req.virtual_storage, &req.relative_path)?;
        let plan = self
            .store
            .rename_repository(record.repository_id, &new_path)?;

        if let Some(new_replica_path) = &plan.new_replica_path {
            let renamed = RepositoryRecord {
                relative_path: new_path.clone(),
                replica_path: plan.old_replica_path.clone(),
                ..record.clone()
            };
            for target in &plan.storages {
                self.enqueue_repair(
                    &renamed,
                    ChangeType::Rename,
                    None,
                    target,
                    Some(new_replica_path.clone()),
                );
            }
        }

        Ok(ClientResponse {
            payload: Bytes::new(),
            repository_id: record.repository_id,
        })
    }

    /// Forward housekeeping to every existing replica; failures are
    /// queued for retry instead of failing the call.
    async fn maintenance(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        let record = self
            .store
            .get_repository_by_path(&req.virtual_storage, &req.relative_path)?;
        let replicas = self.store.get_replicas(record.repository_id)?;
        let change = maintenance_change_type(&req.operation)?;

        let targets: Vec<String> = replicas
            .iter()
            .filter(|r| r.generation.is_some())
            .map(|r| r.storage.clone())
            .collect();

        let mut set: JoinSet<(String, Result<NodeResponse>)> = JoinSet::new();
        for storage in &targets {
            let nodes = self.nodes.clone();
            let virtual_storage = req.virtual_storage.clone();
            let node_req = NodeRequest {
                storage: storage.clone(),
                replica_path: record.replica_path.clone(),
                operation: req.operation.clone(),
                payload: req.payload.clone(),
                vote: None,
            };
            let storage = storage.clone();
            set.spawn(async move {
                let result = match nodes.checkout(&virtual_storage, &storage).await {
                    Ok(slot) => slot.client.forward(node_req).await,
                    Err(e) => Err(e),
                };
                (storage, result)
            });
        }

        let results = self.collect_round(ctx, None, set).await?;
        for (storage, result) in &results {
            if let Err(e) = result {
                tracing::warn!(
                    repository_id = record.repository_id,
                    storage = %storage,
                    "housekeeping failed, queueing for retry: {}",
                    e
                );
                self.enqueue_repair(&record, change, None, storage, None);
            }
        }

        Ok(ClientResponse {
            payload: Bytes::new(),
            repository_id: record.repository_id,
        })
    }

    /// Open one voted stream per participant and collect every result.
    async fn run_voted_round(
        &self,
        ctx: &RequestContext,
        req: &ClientRequest,
        replica_path: &str,
        primary: &str,
        participants: &[String],
    ) -> Result<HashMap<String, Result<NodeResponse>>> {
        let vs_config = self
            .config
            .virtual_storage(&req.virtual_storage)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown virtual storage: {}",
                    req.virtual_storage
                ))
            })?;
        let threshold = vs_config.quorum(participants.len());
        let voters: Vec<Voter> = participants
            .iter()
            .map(|storage| Voter {
                storage: storage.clone(),
                is_primary: storage == primary,
            })
            .collect();
        let transaction_id = self.transactions.register(threshold, voters);

        let mut set: JoinSet<(String, Result<NodeResponse>)> = JoinSet::new();
        for storage in participants {
            let nodes = self.nodes.clone();
            let virtual_storage = req.virtual_storage.clone();
            let node_req = NodeRequest {
                storage: storage.clone(),
                replica_path: replica_path.to_string(),
                operation: req.operation.clone(),
                payload: req.payload.clone(),
                vote: Some(self.transactions.voter_handle(transaction_id, storage)),
            };
            let storage = storage.clone();
            set.spawn(async move {
                let result = match nodes.checkout(&virtual_storage, &storage).await {
                    Ok(slot) => slot.client.forward(node_req).await,
                    Err(e) => Err(e),
                };
                (storage, result)
            });
        }

        let results = self.collect_round(ctx, Some(transaction_id), set).await;
        self.transactions.finish(transaction_id);
        results
    }

    /// Drain a round of backend streams, propagating client
    /// cancellation to every stream and to the vote coordinator.
    async fn collect_round(
        &self,
        ctx: &RequestContext,
        transaction_id: Option<u64>,
        mut set: JoinSet<(String, Result<NodeResponse>)>,
    ) -> Result<HashMap<String, Result<NodeResponse>>> {
        let mut results = HashMap::new();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    if let Some(id) = transaction_id {
                        self.transactions.cancel(id);
                    }
                    set.abort_all();
                    return Err(Error::Canceled("client cancelled request".into()));
                }
                next = set.join_next() => match next {
                    None => break,
                    Some(Ok((storage, result))) => {
                        results.insert(storage, result);
                    }
                    Some(Err(e)) => {
                        return Err(Error::Internal(format!("backend stream task failed: {}", e)));
                    }
                }
            }
        }
        Ok(results)
    }

    /// Apply the aggregation rules for a committed or failed mutator.
    fn settle_mutator(
        &self,
        record: &RepositoryRecord,
        primary: &str,
        primary_generation: u64,
        secondaries: &[String],
        assigned: &[String],
        mut results: HashMap<String, Result<NodeResponse>>,
    ) -> Result<ClientResponse> {
        let primary_result = results
            .remove(primary)
            .ok_or_else(|| Error::Internal("primary stream vanished".into()))?;

        let response = match primary_result {
            Err(e) => {
                // The primary failed or its vote aborted: the client
                // sees the failure and no state moves.
                Metrics::incr(&METRICS.mutators_failed);
                return Err(e);
            }
            Ok(response) => response,
        };

        let updated: Vec<String> = secondaries
            .iter()
            .filter(|s| matches!(results.get(*s), Some(Ok(_))))
            .cloned()
            .collect();
        self.store.increment_generation(
            record.repository_id,
            primary,
            &updated,
            primary_generation,
        )?;

        // Everything assigned that did not take the write needs repair:
        // secondaries that failed their stream or lost the vote, and
        // replicas that were skipped as unhealthy or outdated.
        let up_to_date: HashSet<String> = std::iter::once(primary.to_string())
            .chain(updated.iter().cloned())
            .collect();
        for target in assigned {
            if up_to_date.contains(target) {
                continue;
            }
            self.enqueue_repair(record, ChangeType::Update, Some(primary), target, None);
        }

        Ok(ClientResponse {
            payload: response.payload,
            repository_id: record.repository_id,
        })
    }

    async fn forward_to(
        &self,
        ctx: &RequestContext,
        virtual_storage: &str,
        req: NodeRequest,
    ) -> Result<NodeResponse> {
        let slot = self.nodes.checkout(virtual_storage, &req.storage).await?;
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled("client cancelled request".into())),
            result = slot.client.forward(req) => result,
        }
    }

    fn enqueue_repair(
        &self,
        record: &RepositoryRecord,
        change_type: ChangeType,
        source_storage: Option<&str>,
        target_storage: &str,
        rename_to: Option<String>,
    ) {
        let outcome = self.store.enqueue(NewJob {
            change_type,
            virtual_storage: record.virtual_storage.clone(),
            repository_id: record.repository_id,
            relative_path: record.relative_path.clone(),
            replica_path: record.replica_path.clone(),
            source_storage: source_storage.map(|s| s.to_string()),
            target_storage: target_storage.to_string(),
            rename_to,
        });
        match outcome {
            Ok(EnqueueOutcome::Enqueued(_)) => Metrics::incr(&METRICS.jobs_enqueued),
            Ok(EnqueueOutcome::Absorbed(_)) => Metrics::incr(&METRICS.jobs_absorbed),
            Err(e) => {
                tracing::error!(
                    repository_id = record.repository_id,
                    target = %target_storage,
                    "failed to enqueue {} job: {}",
                    change_type,
                    e
                );
            }
        }
    }
}

fn maintenance_change_type(operation: &str) -> Result<ChangeType> {
    Ok(match operation {
        "gc" => ChangeType::Gc,
        "repack" => ChangeType::Repack,
        "pack_refs" => ChangeType::PackRefs,
        "prune" => ChangeType::Prune,
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown maintenance operation: {}",
                other
            )))
        }
    })
}
