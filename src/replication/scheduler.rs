//! Replication scheduler
//!
//! Leases jobs from the queue per target storage and executes the
//! smallest repairing operation against the backend. Transient failures
//! retry with exponential backoff and jitter; a missing source is
//! terminal. Generation updates happen before the job completes so a
//! crash re-runs the job rather than losing the repair.

use crate::common::{backoff_delay, Error, Metrics, ReplicationConfig, Result, METRICS};
use crate::router::backend::NodeManager;
use crate::store::{ChangeType, JobState, PlacementStore, ReplicationJob};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct ReplicationScheduler {
    store: Arc<PlacementStore>,
    nodes: Arc<NodeManager>,
    config: ReplicationConfig,
}

impl ReplicationScheduler {
    pub fn new(
        store: Arc<PlacementStore>,
        nodes: Arc<NodeManager>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            config,
        }
    }

    /// Claim and execute one batch for a target storage. Returns the
    /// number of jobs that ran.
    pub async fn process_target(&self, target_storage: &str) -> Result<usize> {
        let lease = Duration::from_secs(self.config.lease_secs);
        let claimed = self.store.claim(
            target_storage,
            self.config.batch_size,
            lease,
            Utc::now(),
        )?;
        let processed = claimed.len();

        for job in claimed {
            let result = tokio::time::timeout(lease, self.execute(&job))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::DeadlineExceeded(format!(
                        "replication job {} overran its lease",
                        job.id
                    )))
                });

            match result {
                Ok(()) => {
                    self.store.complete_job(job.id)?;
                    Metrics::incr(&METRICS.jobs_completed);
                    tracing::info!(
                        job_id = job.id,
                        change = %job.change_type,
                        target = %job.target_storage,
                        repository_id = job.repository_id,
                        "replication job completed"
                    );
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!(
                        job_id = job.id,
                        change = %job.change_type,
                        target = %job.target_storage,
                        "replication job dead: {}",
                        e
                    );
                    self.store.kill_job(job.id)?;
                    Metrics::incr(&METRICS.jobs_dead);
                }
                Err(e) => {
                    let delay = backoff_delay(
                        Duration::from_millis(self.config.base_delay_ms),
                        Duration::from_millis(self.config.max_delay_ms),
                        job.attempt,
                    );
                    let state = self
                        .store
                        .retry_job(job.id, delay, self.config.max_attempts)?;
                    if state == JobState::Dead {
                        tracing::error!(
                            job_id = job.id,
                            attempts = job.attempt,
                            "replication job exhausted its attempts: {}",
                            e
                        );
                        Metrics::incr(&METRICS.jobs_dead);
                    } else {
                        tracing::warn!(
                            job_id = job.id,
                            attempt = job.attempt,
                            "replication job failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                    }
                }
            }
        }

        METRICS.observe_queue_depth(target_storage, self.store.queue_depth(target_storage));
        Ok(processed)
    }

    /// One pass over every target storage with pending work.
    pub async fn process_once(&self) -> Result<usize> {
        let mut processed = 0;
        for target in self.store.busy_targets() {
            processed += self.process_target(&target).await?;
        }
        Ok(processed)
    }

    /// Drain the queue for a target until nothing is claimable. Used by
    /// tests and the track/accept tooling to settle repairs.
    pub async fn drain_target(&self, target_storage: &str) -> Result<usize> {
        let mut total = 0;
        loop {
            let processed = self.process_target(target_storage).await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    async fn execute(&self, job: &ReplicationJob) -> Result<()> {
        let slot = self
            .nodes
            .checkout(&job.virtual_storage, &job.target_storage)
            .await?;

        match job.change_type {
            ChangeType::Create | ChangeType::Update => {
                let source = job.source_storage.as_deref().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "{} job {} has no source storage",
                        job.change_type, job.id
                    ))
                })?;
                // The generation snapshotted at claim time; a source that
                // lost its replica row since enqueue is gone for good.
                let generation = job.source_generation.ok_or_else(|| {
                    Error::NotFound(format!(
                        "source replica {}/{} for job {}",
                        source, job.repository_id, job.id
                    ))
                })?;

                slot.client.replicate(source, &job.replica_path).await?;
                self.store
                    .set_generation(job.repository_id, &job.target_storage, generation)?;
                self.store
                    .set_verified_at(job.repository_id, &job.target_storage, Utc::now())?;
            }
            ChangeType::Delete => {
                slot.client.remove_repository(&job.replica_path).await?;
                self.store
                    .remove_replica(job.repository_id, &job.target_storage)?;
            }
            ChangeType::Rename => {
                let new_path = job.rename_to.as_deref().ok_or_else(|| {
                    Error::InvalidArgument(format!("rename job {} has no target path", job.id))
                })?;
                slot.client
                    .rename_repository(&job.replica_path, new_path)
                    .await?;
            }
            ChangeType::Gc | ChangeType::Repack | ChangeType::PackRefs | ChangeType::Prune => {
                slot.client
                    .housekeeping(&job.replica_path, job.change_type)
                    .await?;
            }
        }
        Ok(())
    }

    /// Worker loop; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.poll_interval_ms.max(10),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.process_once().await {
                tracing::error!("replication sweep failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::backend::{BackendNode, NodeRequest, NodeResponse};
    use crate::store::{CreateRepository, EnqueueOutcome, NewJob};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Backend double that records calls and can fail the first N
    /// replications.
    #[derive(Default)]
    struct ScriptedNode {
        fail_replications: AtomicUsize,
        replicated: Mutex<Vec<(String, String)>>,
        removed: Mutex<Vec<String>>,
        renamed: Mutex<Vec<(String, String)>>,
        housekept: Mutex<Vec<(String, ChangeType)>>,
    }

    #[async_trait]
    impl BackendNode for ScriptedNode {
        async fn forward(&self, _req: NodeRequest) -> Result<NodeResponse> {
            Err(Error::Internal("not used in scheduler tests".into()))
        }

        async fn replicate(&self, source_storage: &str, replica_path: &str) -> Result<()> {
            let remaining = self.fail_replications.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_replications.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ConnectionFailed("scripted failure".into()));
            }
            self.replicated
                .lock()
                .unwrap()
                .push((source_storage.to_string(), replica_path.to_string()));
            Ok(())
        }

        async fn remove_repository(&self, replica_path: &str) -> Result<()> {
            self.removed.lock().unwrap().push(replica_path.to_string());
            Ok(())
        }

        async fn rename_repository(&self, old_path: &str, new_path: &str) -> Result<()> {
            self.renamed
                .lock()
                .unwrap()
                .push((old_path.to_string(), new_path.to_string()));
            Ok(())
        }

        async fn housekeeping(&self, replica_path: &str, task: ChangeType) -> Result<()> {
            self.housekept
                .lock()
                .unwrap()
                .push((replica_path.to_string(), task));
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<PlacementStore>,
        scheduler: ReplicationScheduler,
        node: Arc<ScriptedNode>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut names = HashMap::new();
        names.insert(
            "vs1".to_string(),
            vec!["st-1".to_string(), "st-2".to_string(), "st-3".to_string()],
        );
        let store = Arc::new(PlacementStore::open(dir.path().join("store"), names).unwrap());

        let node = Arc::new(ScriptedNode::default());
        let mut nodes = NodeManager::new();
        for storage in ["st-1", "st-2", "st-3"] {
            nodes.register("vs1", storage, "http://localhost:0", node.clone());
        }

        let scheduler = ReplicationScheduler::new(
            store.clone(),
            Arc::new(nodes),
            ReplicationConfig {
                base_delay_ms: 1,
                max_delay_ms: 10,
                max_attempts: 3,
                ..ReplicationConfig::default()
            },
        );
        Fixture {
            store,
            scheduler,
            node,
            _dir: dir,
        }
    }

    fn create_repo(store: &PlacementStore, path: &str) -> u64 {
        let id = store.reserve_repository_id("vs1", path).unwrap();
        store
            .create_repository(CreateRepository {
                repository_id: id,
                virtual_storage: "vs1".into(),
                relative_path: path.into(),
                replica_path: crate::common::derive_replica_path(id),
                primary: Some("st-1".into()),
                updated_secondaries: vec![],
                outdated_secondaries: vec!["st-2".into()],
                store_assignments: true,
                force: false,
            })
            .unwrap();
        id
    }

    fn enqueue(store: &PlacementStore, repo: u64, change_type: ChangeType) -> EnqueueOutcome {
        let record = store.get_repository(repo).unwrap();
        store
            .enqueue(NewJob {
                change_type,
                virtual_storage: "vs1".into(),
                repository_id: repo,
                relative_path: record.relative_path,
                replica_path: record.replica_path,
                source_storage: (!matches!(change_type, ChangeType::Delete))
                    .then(|| "st-1".to_string()),
                target_storage: "st-2".into(),
                rename_to: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_job_raises_generation() {
        let f = fixture();
        let repo = create_repo(&f.store, "a");
        f.store.increment_generation(repo, "st-1", &[], 0).unwrap();
        enqueue(&f.store, repo, ChangeType::Update);

        let processed = f.scheduler.process_target("st-2").await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(f.node.replicated.lock().unwrap().len(), 1);

        let replicas = f.store.get_replicas(repo).unwrap();
        let st2 = replicas.iter().find(|r| r.storage == "st-2").unwrap();
        assert_eq!(st2.generation, Some(1));
        assert!(st2.verified_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let f = fixture();
        let repo = create_repo(&f.store, "a");
        f.store.increment_generation(repo, "st-1", &[], 0).unwrap();
        enqueue(&f.store, repo, ChangeType::Update);
        f.node.fail_replications.store(1, Ordering::SeqCst);

        f.scheduler.process_target("st-2").await.unwrap();
        let job = &f.store.jobs_for_repository(repo)[0];
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.attempt, 1);

        // Wait out the backoff (base 1ms, attempt 1)
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.scheduler.process_target("st-2").await.unwrap();
        let job = &f.store.jobs_for_repository(repo)[0];
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_missing_source_is_dead() {
        let f = fixture();
        let repo = create_repo(&f.store, "a");
        // st-3 has no replica row, so the claim snapshots no generation
        let record = f.store.get_repository(repo).unwrap();
        f.store
            .enqueue(NewJob {
                change_type: ChangeType::Update,
                virtual_storage: "vs1".into(),
                repository_id: repo,
                relative_path: record.relative_path,
                replica_path: record.replica_path,
                source_storage: Some("st-3".into()),
                target_storage: "st-2".into(),
                rename_to: None,
            })
            .unwrap();

        f.scheduler.process_target("st-2").await.unwrap();
        let job = &f.store.jobs_for_repository(repo)[0];
        assert_eq!(job.state, JobState::Dead);
    }

    #[tokio::test]
    async fn test_delete_job_removes_replica_row() {
        let f = fixture();
        let repo = create_repo(&f.store, "a");
        f.store.set_generation(repo, "st-2", 0).unwrap();
        enqueue(&f.store, repo, ChangeType::Delete);

        f.scheduler.process_target("st-2").await.unwrap();
        assert_eq!(f.node.removed.lock().unwrap().len(), 1);
        let replicas = f.store.get_replicas(repo).unwrap();
        let st2 = replicas.iter().find(|r| r.storage == "st-2").unwrap();
        assert_eq!(st2.generation, None);
    }

    #[tokio::test]
    async fn test_maintenance_does_not_move_generation() {
        let f = fixture();
        let repo = create_repo(&f.store, "a");
        f.store.set_generation(repo, "st-2", 0).unwrap();
        enqueue(&f.store, repo, ChangeType::Gc);

        f.scheduler.process_target("st-2").await.unwrap();
        assert_eq!(f.node.housekept.lock().unwrap().len(), 1);
        let replicas = f.store.get_replicas(repo).unwrap();
        let st2 = replicas.iter().find(|r| r.storage == "st-2").unwrap();
        assert_eq!(st2.generation, Some(0));
    }
}
