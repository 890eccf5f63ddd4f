//! Replication queue
//!
//! A durable FIFO stored alongside the placement rows. Jobs for the
//! same `(target storage, repository)` execute in enqueue order,
//! enforced through a per-pair lock row; workers lease jobs with a
//! visibility timeout and either complete them or hand them back for
//! retry.

use super::{encode, PlacementStore, State};
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CF_QUEUE: &str = "queue";
const CF_QUEUE_LOCKS: &str = "queue_locks";
const CF_META: &str = "meta";
const META_NEXT_JOB_ID: &str = "next_job_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Update,
    Create,
    Delete,
    Rename,
    Gc,
    Repack,
    PackRefs,
    Prune,
}

impl ChangeType {
    /// Maintenance jobs do not move generations.
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            ChangeType::Gc | ChangeType::Repack | ChangeType::PackRefs | ChangeType::Prune
        )
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeType::Update => "update",
            ChangeType::Create => "create",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
            ChangeType::Gc => "gc",
            ChangeType::Repack => "repack",
            ChangeType::PackRefs => "pack_refs",
            ChangeType::Prune => "prune",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InProgress,
    Completed,
    Dead,
    Cancelled,
}

/// One queued unit of repair work against a single replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub id: u64,
    pub change_type: ChangeType,
    pub virtual_storage: String,
    pub repository_id: u64,
    pub relative_path: String,
    /// On-disk path the worker operates on
    pub replica_path: String,
    pub source_storage: Option<String>,
    pub target_storage: String,
    /// New on-disk path, for rename jobs
    pub rename_to: Option<String>,
    /// Source generation observed at claim time
    pub source_generation: Option<u64>,
    pub state: JobState,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest claim instant while ready (retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    /// Lease expiry while in progress
    pub locked_until: Option<DateTime<Utc>>,
}

impl ReplicationJob {
    pub fn lock_key(&self) -> String {
        format!("{}|{}", self.target_storage, self.repository_id)
    }
}

/// Parameters for [`PlacementStore::enqueue`]
#[derive(Debug, Clone)]
pub struct NewJob {
    pub change_type: ChangeType,
    pub virtual_storage: String,
    pub repository_id: u64,
    pub relative_path: String,
    pub replica_path: String,
    pub source_storage: Option<String>,
    pub target_storage: String,
    pub rename_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was added
    Enqueued(u64),
    /// An identical ready job already existed; nothing was added
    Absorbed(u64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> u64 {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Absorbed(id) => *id,
        }
    }
}

fn lock_key(target_storage: &str, repository_id: u64) -> String {
    format!("{}|{}", target_storage, repository_id)
}

impl PlacementStore {
    /// Append a job. An identical `ready` job absorbs the duplicate; a
    /// `delete` cancels every earlier `ready` job for the same
    /// `(target, repository)`.
    pub fn enqueue(&self, new: NewJob) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        // Duplicate absorption
        for job in state.queue.values() {
            if job.state == JobState::Ready
                && job.target_storage == new.target_storage
                && job.repository_id == new.repository_id
                && job.change_type == new.change_type
                && job.source_storage == new.source_storage
                && job.rename_to == new.rename_to
            {
                return Ok(EnqueueOutcome::Absorbed(job.id));
            }
        }

        let mut batch = WriteBatch::default();
        let mut cancelled = Vec::new();
        if new.change_type == ChangeType::Delete {
            for job in state.queue.values() {
                if job.state == JobState::Ready
                    && job.target_storage == new.target_storage
                    && job.repository_id == new.repository_id
                {
                    let mut job = job.clone();
                    job.state = JobState::Cancelled;
                    job.updated_at = now;
                    batch.put_cf(self.cf(CF_QUEUE), job.id.to_be_bytes(), encode(&job)?);
                    cancelled.push(job);
                }
            }
        }

        let id = state.next_job_id;
        let job = ReplicationJob {
            id,
            change_type: new.change_type,
            virtual_storage: new.virtual_storage,
            repository_id: new.repository_id,
            relative_path: new.relative_path,
            replica_path: new.replica_path,
            source_storage: new.source_storage,
            target_storage: new.target_storage,
            rename_to: new.rename_to,
            source_generation: None,
            state: JobState::Ready,
            attempt: 0,
            created_at: now,
            updated_at: now,
            not_before: None,
            locked_until: None,
        };
        batch.put_cf(self.cf(CF_QUEUE), id.to_be_bytes(), encode(&job)?);
        batch.put_cf(self.cf(CF_META), META_NEXT_JOB_ID, encode(&(id + 1))?);
        self.write(batch)?;

        for job in cancelled {
            state.queue.insert(job.id, job);
        }
        state.queue.insert(id, job);
        state.next_job_id = id + 1;
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Lease up to `limit` ready jobs for a target storage.
    ///
    /// Expired leases are returned to `ready` first. A job is claimable
    /// when its backoff window has passed and no other job holds the
    /// `(target, repository)` lock; scanning in id order keeps
    /// per-repository FIFO order. The source generation each job should
    /// replicate toward is snapshotted here.
    pub fn claim(
        &self,
        target_storage: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReplicationJob>> {
        let mut state = self.state.lock().unwrap();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::InvalidArgument(format!("lease out of range: {}", e)))?;

        let mut batch = WriteBatch::default();

        // Recover expired leases
        let expired: Vec<u64> = state
            .queue
            .values()
            .filter(|j| {
                j.state == JobState::InProgress
                    && j.locked_until.map(|t| t < now).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();
        for id in &expired {
            let mut job = state.queue[id].clone();
            tracing::warn!(
                job_id = job.id,
                target = %job.target_storage,
                "replication lease expired, returning job to ready"
            );
            job.state = JobState::Ready;
            job.locked_until = None;
            job.updated_at = now;
            let key = job.lock_key();
            batch.put_cf(self.cf(CF_QUEUE), job.id.to_be_bytes(), encode(&job)?);
            batch.put_cf(self.cf(CF_QUEUE_LOCKS), key.as_bytes(), encode(&false)?);
            state.queue_locks.insert(key, false);
            state.queue.insert(job.id, job);
        }

        let mut claimed = Vec::new();
        let candidates: Vec<u64> = state
            .queue
            .values()
            .filter(|j| {
                j.state == JobState::Ready
                    && j.target_storage == target_storage
                    && j.not_before.map(|t| t <= now).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();

        for id in candidates {
            if claimed.len() >= limit {
                break;
            }
            let job = state.queue[&id].clone();
            let key = job.lock_key();
            if state.queue_locks.get(&key).copied().unwrap_or(false) {
                continue;
            }

            let source_generation = job.source_storage.as_ref().and_then(|source| {
                state
                    .replicas
                    .get(&(job.repository_id, source.clone()))
                    .map(|r| r.generation)
            });

            let mut job = job;
            job.state = JobState::InProgress;
            job.attempt += 1;
            job.locked_until = Some(now + lease);
            job.not_before = None;
            job.source_generation = source_generation;
            job.updated_at = now;

            batch.put_cf(self.cf(CF_QUEUE), job.id.to_be_bytes(), encode(&job)?);
            batch.put_cf(self.cf(CF_QUEUE_LOCKS), key.as_bytes(), encode(&true)?);
            state.queue_locks.insert(key, true);
            state.queue.insert(job.id, job.clone());
            claimed.push(job);
        }

        self.write(batch)?;
        Ok(claimed)
    }

    /// Mark a leased job done and release its lock.
    pub fn complete_job(&self, job_id: u64) -> Result<()> {
        self.finish_job(job_id, JobState::Completed, None)
    }

    /// Mark a leased job dead and release its lock.
    pub fn kill_job(&self, job_id: u64) -> Result<()> {
        self.finish_job(job_id, JobState::Dead, None)
    }

    /// Hand a failed job back. It retries after `backoff` unless the
    /// attempt budget is spent, in which case it is dead.
    pub fn retry_job(&self, job_id: u64, backoff: Duration, max_attempts: u32) -> Result<JobState> {
        let attempt = {
            let state = self.state.lock().unwrap();
            state
                .queue
                .get(&job_id)
                .ok_or_else(|| Error::NotFound(format!("replication job {}", job_id)))?
                .attempt
        };
        if attempt >= max_attempts {
            self.finish_job(job_id, JobState::Dead, None)?;
            Ok(JobState::Dead)
        } else {
            self.finish_job(job_id, JobState::Ready, Some(backoff))?;
            Ok(JobState::Ready)
        }
    }

    fn finish_job(
        &self,
        job_id: u64,
        new_state: JobState,
        backoff: Option<Duration>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .queue
            .get(&job_id)
            .ok_or_else(|| Error::NotFound(format!("replication job {}", job_id)))?;
        if job.state != JobState::InProgress {
            return Err(Error::FailedPrecondition(format!(
                "replication job {} is not in progress",
                job_id
            )));
        }

        let now = Utc::now();
        let mut job = job.clone();
        job.state = new_state;
        job.locked_until = None;
        job.not_before = backoff
            .map(|b| now + chrono::Duration::from_std(b).unwrap_or_else(|_| chrono::Duration::zero()));
        job.updated_at = now;
        let key = job.lock_key();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_QUEUE), job.id.to_be_bytes(), encode(&job)?);
        batch.put_cf(self.cf(CF_QUEUE_LOCKS), key.as_bytes(), encode(&false)?);
        self.write(batch)?;

        state.queue_locks.insert(key, false);
        state.queue.insert(job_id, job);
        Ok(())
    }

    /// Ready plus in-progress jobs targeting a storage.
    pub fn queue_depth(&self, target_storage: &str) -> u64 {
        let state = self.state.lock().unwrap();
        Self::queue_depth_locked(&state, target_storage)
    }

    pub(crate) fn queue_depth_locked(state: &State, target_storage: &str) -> u64 {
        state
            .queue
            .values()
            .filter(|j| {
                j.target_storage == target_storage
                    && matches!(j.state, JobState::Ready | JobState::InProgress)
            })
            .count() as u64
    }

    /// All jobs for a repository in id order, any state.
    pub fn jobs_for_repository(&self, repository_id: u64) -> Vec<ReplicationJob> {
        let state = self.state.lock().unwrap();
        state
            .queue
            .values()
            .filter(|j| j.repository_id == repository_id)
            .cloned()
            .collect()
    }

    /// Target storages that currently have claimable or leased work.
    pub fn busy_targets(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut targets: Vec<String> = state
            .queue
            .values()
            .filter(|j| matches!(j.state, JobState::Ready | JobState::InProgress))
            .map(|j| j.target_storage.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CreateRepository;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> PlacementStore {
        let mut names = HashMap::new();
        names.insert(
            "vs1".to_string(),
            vec!["st-1".to_string(), "st-2".to_string(), "st-3".to_string()],
        );
        PlacementStore::open(dir.path().join("store"), names).unwrap()
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
                outdated_secondaries: vec!["st-2".into(), "st-3".into()],
                store_assignments: true,
                force: false,
            })
            .unwrap();
        id
    }

    fn update_job(store: &PlacementStore, repository_id: u64, target: &str) -> NewJob {
        let record = store.get_repository(repository_id).unwrap();
        NewJob {
            change_type: ChangeType::Update,
            virtual_storage: "vs1".into(),
            repository_id,
            relative_path: record.relative_path.clone(),
            replica_path: record.replica_path,
            source_storage: Some("st-1".into()),
            target_storage: target.into(),
            rename_to: None,
        }
    }

    #[test]
    fn test_enqueue_and_claim_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo_a = create_repo(&store, "a");
        let repo_b = create_repo(&store, "b");

        store.enqueue(update_job(&store, repo_a, "st-2")).unwrap();
        store.enqueue(update_job(&store, repo_b, "st-2")).unwrap();

        let claimed = store
            .claim("st-2", 10, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed[0].id < claimed[1].id);
        assert_eq!(claimed[0].repository_id, repo_a);
        assert_eq!(claimed[0].attempt, 1);
    }

    #[test]
    fn test_duplicate_ready_job_absorbed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");

        let first = store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        let second = store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Absorbed(first.job_id()));
        assert_eq!(store.queue_depth("st-2"), 1);
    }

    #[test]
    fn test_lock_serializes_same_repository() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");

        store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        let mut gc = update_job(&store, repo, "st-2");
        gc.change_type = ChangeType::Gc;
        gc.source_storage = None;
        store.enqueue(gc).unwrap();

        // Only the oldest job for the (target, repo) pair is claimable
        let claimed = store
            .claim("st-2", 10, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].change_type, ChangeType::Update);

        // Completing it unlocks the next one
        store.complete_job(claimed[0].id).unwrap();
        let claimed = store
            .claim("st-2", 10, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].change_type, ChangeType::Gc);
    }

    #[test]
    fn test_delete_supersedes_queued_jobs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");

        let update = store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        let mut delete = update_job(&store, repo, "st-2");
        delete.change_type = ChangeType::Delete;
        delete.source_storage = None;
        store.enqueue(delete).unwrap();

        let jobs = store.jobs_for_repository(repo);
        let update_row = jobs.iter().find(|j| j.id == update.job_id()).unwrap();
        assert_eq!(update_row.state, JobState::Cancelled);

        let claimed = store
            .claim("st-2", 10, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].change_type, ChangeType::Delete);
    }

    #[test]
    fn test_retry_backoff_then_dead() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");
        store.enqueue(update_job(&store, repo, "st-2")).unwrap();

        let now = Utc::now();
        let claimed = store.claim("st-2", 1, Duration::from_secs(30), now).unwrap();
        let id = claimed[0].id;

        let state = store
            .retry_job(id, Duration::from_secs(60), 2)
            .unwrap();
        assert_eq!(state, JobState::Ready);

        // Backoff window holds the job back
        let claimed = store.claim("st-2", 1, Duration::from_secs(30), now).unwrap();
        assert!(claimed.is_empty());

        // After the window it can be claimed again; the second failure
        // exhausts the attempt budget
        let later = now + chrono::Duration::seconds(120);
        let claimed = store.claim("st-2", 1, Duration::from_secs(30), later).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 2);
        let state = store
            .retry_job(id, Duration::from_secs(60), 2)
            .unwrap();
        assert_eq!(state, JobState::Dead);
    }

    #[test]
    fn test_expired_lease_recovered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");
        store.enqueue(update_job(&store, repo, "st-2")).unwrap();

        let now = Utc::now();
        let claimed = store.claim("st-2", 1, Duration::from_secs(5), now).unwrap();
        assert_eq!(claimed.len(), 1);

        // Nothing claimable while the lease holds
        let meanwhile = store.claim("st-2", 1, Duration::from_secs(5), now).unwrap();
        assert!(meanwhile.is_empty());

        // Past the lease the job is claimable again
        let later = now + chrono::Duration::seconds(10);
        let reclaimed = store.claim("st-2", 1, Duration::from_secs(5), later).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);
        assert_eq!(reclaimed[0].attempt, 2);
    }

    #[test]
    fn test_claim_snapshots_source_generation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");
        store.increment_generation(repo, "st-1", &[], 0).unwrap();
        store.enqueue(update_job(&store, repo, "st-2")).unwrap();

        let claimed = store
            .claim("st-2", 1, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed[0].source_generation, Some(1));

        // A mutator racing past the claim does not move the snapshot
        store.increment_generation(repo, "st-1", &[], 1).unwrap();
        let job = store
            .jobs_for_repository(repo)
            .into_iter()
            .find(|j| j.id == claimed[0].id)
            .unwrap();
        assert_eq!(job.source_generation, Some(1));
    }

    #[test]
    fn test_rename_bumps_queued_jobs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let repo = create_repo(&store, "a");
        store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        store.enqueue(update_job(&store, repo, "st-3")).unwrap();

        store.rename_repository(repo, "a-moved").unwrap();

        for job in store.jobs_for_repository(repo) {
            assert_eq!(job.relative_path, "a-moved");
        }
    }

    #[test]
    fn test_queue_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let repo;
        {
            let store = open_store(&dir);
            repo = create_repo(&store, "a");
            store.enqueue(update_job(&store, repo, "st-2")).unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.queue_depth("st-2"), 1);
        let claimed = store
            .claim("st-2", 1, Duration::from_secs(30), Utc::now())
            .unwrap();
        assert_eq!(claimed[0].repository_id, repo);
    }
}
