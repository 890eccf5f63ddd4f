//! Placement store
//!
//! The authoritative record of which replicas exist, which generation
//! each holds, which storages are assigned, which replica is primary,
//! per-router health reports, and the replication queue.
//!
//! Rows live in RocksDB column families (bincode-encoded); an in-memory
//! image guarded by a single mutex gives every public operation
//! serializable semantics. A mutation validates against the image,
//! writes one `WriteBatch`, and only then updates the image, so a
//! failed disk write leaves the store unchanged.

pub mod queue;

pub use queue::{ChangeType, EnqueueOutcome, JobState, NewJob, ReplicationJob};

use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const CF_META: &str = "meta";
const CF_REPOSITORIES: &str = "repositories";
const CF_REPLICAS: &str = "replicas";
const CF_ASSIGNMENTS: &str = "assignments";
const CF_QUEUE: &str = "queue";
const CF_QUEUE_LOCKS: &str = "queue_locks";
const CF_NODE_STATUS: &str = "node_status";

const META_NEXT_REPOSITORY_ID: &str = "next_repository_id";
const META_NEXT_JOB_ID: &str = "next_job_id";

/// Repository row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub repository_id: u64,
    pub virtual_storage: String,
    /// Client-visible path; unique per virtual storage
    pub relative_path: String,
    /// On-disk path on every backend; never exposed to clients
    pub replica_path: String,
    /// Current primary, or None while the repository is unavailable
    pub primary: Option<String>,
}

/// One physical copy of a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub repository_id: u64,
    pub storage: String,
    pub generation: u64,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Replica view merged with assignment data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub storage: String,
    /// None means the replica has not been created yet
    pub generation: Option<u64>,
    pub assigned: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Replica view extended with health, for operator reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaDetail {
    pub storage: String,
    pub generation: Option<u64>,
    pub assigned: bool,
    pub healthy: bool,
    pub valid_primary: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Full repository view for operator reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDetails {
    pub repository_id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub replica_path: String,
    pub primary: Option<String>,
    pub max_generation: u64,
    pub replicas: Vec<ReplicaDetail>,
}

impl RepositoryDetails {
    /// At least one assigned replica is both up to date and healthy.
    pub fn available(&self) -> bool {
        self.replicas
            .iter()
            .any(|r| r.assigned && r.healthy && r.generation == Some(self.max_generation))
    }

    /// Available, but some assigned replica is out of date or unhealthy.
    pub fn partially_available(&self) -> bool {
        self.available()
            && self
                .replicas
                .iter()
                .any(|r| r.assigned && (!r.healthy || r.generation != Some(self.max_generation)))
    }
}

/// Per-router health report for one storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub router: String,
    pub virtual_storage: String,
    pub storage: String,
    pub last_contact_at: DateTime<Utc>,
    pub last_seen_active_at: Option<DateTime<Utc>>,
}

/// Parameters for [`PlacementStore::create_repository`]
#[derive(Debug, Clone)]
pub struct CreateRepository {
    pub repository_id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub replica_path: String,
    pub primary: Option<String>,
    /// Secondaries that hold the repository at generation 0
    pub updated_secondaries: Vec<String>,
    /// Secondaries that still need the repository replicated to them
    pub outdated_secondaries: Vec<String>,
    pub store_assignments: bool,
    /// Replace an existing record instead of failing with AlreadyExists
    pub force: bool,
}

/// Outcome of a rename, telling the caller whether on-disk renames are
/// needed (only for repositories whose replica path tracks the
/// client-visible path, i.e. ones registered out of band).
#[derive(Debug, Clone)]
pub struct RenamePlan {
    pub old_replica_path: String,
    /// Set when the replica path changed along with the relative path
    pub new_replica_path: Option<String>,
    /// Storages holding a replica at rename time
    pub storages: Vec<String>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) next_repository_id: u64,
    pub(crate) next_job_id: u64,
    pub(crate) reservations: HashMap<(String, String), u64>,
    pub(crate) repositories: BTreeMap<u64, RepositoryRecord>,
    pub(crate) by_path: HashMap<(String, String), u64>,
    pub(crate) replicas: BTreeMap<(u64, String), ReplicaRecord>,
    pub(crate) assignments: BTreeSet<(u64, String)>,
    pub(crate) queue: BTreeMap<u64, ReplicationJob>,
    pub(crate) queue_locks: HashMap<String, bool>,
    pub(crate) node_status: HashMap<(String, String, String), NodeStatus>,
}

/// Placement store
pub struct PlacementStore {
    db: DB,
    pub(crate) state: Mutex<State>,
    storage_names: HashMap<String, Vec<String>>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("serialize error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Corrupted(e.to_string()))
}

fn replica_key(repository_id: u64, storage: &str) -> Vec<u8> {
    let mut key = repository_id.to_be_bytes().to_vec();
    key.push(b'/');
    key.extend_from_slice(storage.as_bytes());
    key
}

fn node_status_key(router: &str, virtual_storage: &str, storage: &str) -> Vec<u8> {
    format!("{}\u{1f}{}\u{1f}{}", router, virtual_storage, storage).into_bytes()
}

impl PlacementStore {
    /// Open or create the store. `storage_names` is the configured set
    /// of physical storages per virtual storage; replicas and
    /// assignments outside it are rejected.
    pub fn open(
        path: impl AsRef<Path>,
        storage_names: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![
                CF_META,
                CF_REPOSITORIES,
                CF_REPLICAS,
                CF_ASSIGNMENTS,
                CF_QUEUE,
                CF_QUEUE_LOCKS,
                CF_NODE_STATUS,
            ],
        )?;

        let state = Self::load_state(&db)?;

        Ok(Self {
            db,
            state: Mutex::new(state),
            storage_names,
        })
    }

    fn load_state(db: &DB) -> Result<State> {
        let mut state = State {
            next_repository_id: 1,
            next_job_id: 1,
            ..State::default()
        };

        let cf = db.cf_handle(CF_META).unwrap();
        if let Some(bytes) = db.get_cf(cf, META_NEXT_REPOSITORY_ID)? {
            state.next_repository_id = decode(&bytes)?;
        }
        if let Some(bytes) = db.get_cf(cf, META_NEXT_JOB_ID)? {
            state.next_job_id = decode(&bytes)?;
        }

        let cf = db.cf_handle(CF_REPOSITORIES).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: RepositoryRecord = decode(&value)?;
            state.by_path.insert(
                (record.virtual_storage.clone(), record.relative_path.clone()),
                record.repository_id,
            );
            state.repositories.insert(record.repository_id, record);
        }

        let cf = db.cf_handle(CF_REPLICAS).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: ReplicaRecord = decode(&value)?;
            state
                .replicas
                .insert((record.repository_id, record.storage.clone()), record);
        }

        let cf = db.cf_handle(CF_ASSIGNMENTS).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (repository_id, storage): (u64, String) = decode(&value)?;
            state.assignments.insert((repository_id, storage));
        }

        let cf = db.cf_handle(CF_QUEUE).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let job: ReplicationJob = decode(&value)?;
            state.queue.insert(job.id, job);
        }

        let cf = db.cf_handle(CF_QUEUE_LOCKS).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let lock_key = String::from_utf8(key.to_vec())
                .map_err(|_| Error::Corrupted("invalid queue lock key".into()))?;
            let acquired: bool = decode(&value)?;
            state.queue_locks.insert(lock_key, acquired);
        }

        let cf = db.cf_handle(CF_NODE_STATUS).unwrap();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let status: NodeStatus = decode(&value)?;
            state.node_status.insert(
                (
                    status.router.clone(),
                    status.virtual_storage.clone(),
                    status.storage.clone(),
                ),
                status,
            );
        }

        Ok(state)
    }

    pub(crate) fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        // Column families are created at open; a missing one is a bug.
        self.db.cf_handle(name).unwrap()
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    pub fn configured_storages(&self, virtual_storage: &str) -> Result<&[String]> {
        self.storage_names
            .get(virtual_storage)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("unknown virtual storage: {}", virtual_storage))
            })
    }

    pub fn virtual_storages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storage_names.keys().cloned().collect();
        names.sort();
        names
    }

    // === Repository operations ===

    /// Reserve an id for a repository about to be created. Idempotent
    /// per `(virtual_storage, relative_path)` until the repository is
    /// materialized; fails with AlreadyExists once it is.
    pub fn reserve_repository_id(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<u64> {
        self.configured_storages(virtual_storage)?;
        let mut state = self.state.lock().unwrap();

        let key = (virtual_storage.to_string(), relative_path.to_string());
        if state.by_path.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "repository {}/{}",
                virtual_storage, relative_path
            )));
        }
        if let Some(id) = state.reservations.get(&key) {
            return Ok(*id);
        }

        let id = state.next_repository_id;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_META),
            META_NEXT_REPOSITORY_ID,
            encode(&(id + 1))?,
        );
        self.write(batch)?;

        state.next_repository_id = id + 1;
        state.reservations.insert(key, id);
        Ok(id)
    }

    /// Atomically insert the repository row and all initial replica rows.
    pub fn create_repository(&self, params: CreateRepository) -> Result<()> {
        let configured: HashSet<String> = self
            .configured_storages(&params.virtual_storage)?
            .iter()
            .cloned()
            .collect();

        for storage in params
            .primary
            .iter()
            .chain(&params.updated_secondaries)
            .chain(&params.outdated_secondaries)
        {
            if !configured.contains(storage) {
                return Err(Error::InvalidArgument(format!(
                    "storage {} not configured for virtual storage {}",
                    storage, params.virtual_storage
                )));
            }
        }

        let mut state = self.state.lock().unwrap();
        let key = (
            params.virtual_storage.clone(),
            params.relative_path.clone(),
        );
        if let Some(existing) = state.by_path.get(&key) {
            if !params.force {
                return Err(Error::AlreadyExists(format!(
                    "repository {}/{} (id {})",
                    params.virtual_storage, params.relative_path, existing
                )));
            }
        }

        let record = RepositoryRecord {
            repository_id: params.repository_id,
            virtual_storage: params.virtual_storage.clone(),
            relative_path: params.relative_path.clone(),
            replica_path: params.replica_path.clone(),
            primary: params.primary.clone(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_REPOSITORIES),
            params.repository_id.to_be_bytes(),
            encode(&record)?,
        );

        let mut replica_rows = Vec::new();
        for storage in params.primary.iter().chain(&params.updated_secondaries) {
            let replica = ReplicaRecord {
                repository_id: params.repository_id,
                storage: storage.clone(),
                generation: 0,
                verified_at: None,
            };
            batch.put_cf(
                self.cf(CF_REPLICAS),
                replica_key(params.repository_id, storage),
                encode(&replica)?,
            );
            replica_rows.push(replica);
        }

        let mut assignment_rows = Vec::new();
        if params.store_assignments {
            for storage in params
                .primary
                .iter()
                .chain(&params.updated_secondaries)
                .chain(&params.outdated_secondaries)
            {
                let row = (params.repository_id, storage.clone());
                batch.put_cf(
                    self.cf(CF_ASSIGNMENTS),
                    replica_key(params.repository_id, storage),
                    encode(&row)?,
                );
                assignment_rows.push(row);
            }
        }

        self.write(batch)?;

        state.by_path.insert(key.clone(), params.repository_id);
        state.reservations.remove(&key);
        state.repositories.insert(params.repository_id, record);
        for replica in replica_rows {
            state
                .replicas
                .insert((params.repository_id, replica.storage.clone()), replica);
        }
        for row in assignment_rows {
            state.assignments.insert(row);
        }
        Ok(())
    }

    /// Set a replica's generation directly. The larger generation wins;
    /// a smaller write is a no-op.
    pub fn set_generation(&self, repository_id: u64, storage: &str, generation: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;
        self.configured_storages(&record.virtual_storage)?
            .iter()
            .find(|s| s.as_str() == storage)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "storage {} not configured for virtual storage {}",
                    storage, record.virtual_storage
                ))
            })?;

        let key = (repository_id, storage.to_string());
        let replica = match state.replicas.get(&key) {
            Some(existing) if existing.generation >= generation => return Ok(()),
            Some(existing) => ReplicaRecord {
                generation,
                ..existing.clone()
            },
            None => ReplicaRecord {
                repository_id,
                storage: storage.to_string(),
                generation,
                verified_at: None,
            },
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_REPLICAS),
            replica_key(repository_id, storage),
            encode(&replica)?,
        );
        self.write(batch)?;
        state.replicas.insert(key, replica);
        Ok(())
    }

    /// Advance the repository's generation after a committed mutator.
    ///
    /// With `expected` equal to the primary's current generation this
    /// raises the primary by one and sets each updated secondary to the
    /// same new generation, leaving every other replica behind. With a
    /// stale `expected` it is a no-op and returns the primary's current
    /// generation.
    pub fn increment_generation(
        &self,
        repository_id: u64,
        primary: &str,
        updated_secondaries: &[String],
        expected: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if !state.repositories.contains_key(&repository_id) {
            return Err(Error::NotFound(format!("repository {}", repository_id)));
        }

        let current = state
            .replicas
            .get(&(repository_id, primary.to_string()))
            .map(|r| r.generation);
        if current != Some(expected) && !(current.is_none() && expected == 0) {
            return Ok(current.unwrap_or(0));
        }
        let new_generation = match current {
            Some(generation) => generation + 1,
            None => 0,
        };

        let mut batch = WriteBatch::default();
        let mut rows = Vec::new();
        for storage in std::iter::once(primary.to_string()).chain(updated_secondaries.iter().cloned())
        {
            let key = (repository_id, storage.clone());
            let replica = match state.replicas.get(&key) {
                Some(existing) => ReplicaRecord {
                    generation: existing.generation.max(new_generation),
                    ..existing.clone()
                },
                None => ReplicaRecord {
                    repository_id,
                    storage: storage.clone(),
                    generation: new_generation,
                    verified_at: None,
                },
            };
            batch.put_cf(
                self.cf(CF_REPLICAS),
                replica_key(repository_id, &storage),
                encode(&replica)?,
            );
            rows.push((key, replica));
        }

        self.write(batch)?;
        for (key, replica) in rows {
            state.replicas.insert(key, replica);
        }
        Ok(new_generation)
    }

    /// Stamp the instant a replica's contents were last verified.
    pub fn set_verified_at(
        &self,
        repository_id: u64,
        storage: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (repository_id, storage.to_string());
        let replica = state
            .replicas
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("replica {}/{}", repository_id, storage)))?;
        let replica = ReplicaRecord {
            verified_at: Some(when),
            ..replica.clone()
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_REPLICAS),
            replica_key(repository_id, storage),
            encode(&replica)?,
        );
        self.write(batch)?;
        state.replicas.insert(key, replica);
        Ok(())
    }

    pub fn get_repository(&self, repository_id: u64) -> Result<RepositoryRecord> {
        let state = self.state.lock().unwrap();
        state
            .repositories
            .get(&repository_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))
    }

    pub fn get_repository_by_path(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryRecord> {
        let state = self.state.lock().unwrap();
        let id = state
            .by_path
            .get(&(virtual_storage.to_string(), relative_path.to_string()))
            .ok_or_else(|| {
                Error::NotFound(format!("repository {}/{}", virtual_storage, relative_path))
            })?;
        Ok(state.repositories[id].clone())
    }

    /// Replicas and assignments for a repository, sorted by storage.
    /// When no assignment rows exist every configured storage counts as
    /// assigned.
    pub fn get_replicas(&self, repository_id: u64) -> Result<Vec<ReplicaInfo>> {
        let state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;
        let configured = self.configured_storages(&record.virtual_storage)?;
        Ok(Self::replicas_locked(&state, repository_id, configured))
    }

    fn assigned_set(state: &State, repository_id: u64, configured: &[String]) -> HashSet<String> {
        let explicit: HashSet<String> = state
            .assignments
            .range((repository_id, String::new())..(repository_id + 1, String::new()))
            .map(|(_, storage)| storage.clone())
            .collect();
        if explicit.is_empty() {
            configured.iter().cloned().collect()
        } else {
            explicit
        }
    }

    fn replicas_locked(
        state: &State,
        repository_id: u64,
        configured: &[String],
    ) -> Vec<ReplicaInfo> {
        let assigned = Self::assigned_set(state, repository_id, configured);

        let mut storages: BTreeSet<String> = assigned.iter().cloned().collect();
        storages.extend(
            state
                .replicas
                .range((repository_id, String::new())..(repository_id + 1, String::new()))
                .map(|((_, storage), _)| storage.clone()),
        );

        storages
            .into_iter()
            .map(|storage| {
                let row = state.replicas.get(&(repository_id, storage.clone()));
                ReplicaInfo {
                    assigned: assigned.contains(&storage),
                    generation: row.map(|r| r.generation),
                    verified_at: row.and_then(|r| r.verified_at),
                    storage,
                }
            })
            .collect()
    }

    /// Highest generation any replica of the repository holds, or None
    /// when no replica has been created yet.
    pub fn max_generation(&self, repository_id: u64) -> Result<Option<u64>> {
        let state = self.state.lock().unwrap();
        if !state.repositories.contains_key(&repository_id) {
            return Err(Error::NotFound(format!("repository {}", repository_id)));
        }
        Ok(Self::max_generation_locked(&state, repository_id))
    }

    fn max_generation_locked(state: &State, repository_id: u64) -> Option<u64> {
        state
            .replicas
            .range((repository_id, String::new())..(repository_id + 1, String::new()))
            .map(|(_, r)| r.generation)
            .max()
    }

    /// Remove the repository record, its replicas and assignments.
    /// Returns the repository id and the storages that held a replica so
    /// the caller can enqueue deletion jobs.
    pub fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<(u64, Vec<String>)> {
        let mut state = self.state.lock().unwrap();
        let key = (virtual_storage.to_string(), relative_path.to_string());
        let id = *state.by_path.get(&key).ok_or_else(|| {
            Error::NotFound(format!("repository {}/{}", virtual_storage, relative_path))
        })?;

        let storages: Vec<String> = state
            .replicas
            .range((id, String::new())..(id + 1, String::new()))
            .map(|((_, storage), _)| storage.clone())
            .collect();
        let assignments: Vec<String> = state
            .assignments
            .range((id, String::new())..(id + 1, String::new()))
            .map(|(_, storage)| storage.clone())
            .collect();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_REPOSITORIES), id.to_be_bytes());
        for storage in &storages {
            batch.delete_cf(self.cf(CF_REPLICAS), replica_key(id, storage));
        }
        for storage in &assignments {
            batch.delete_cf(self.cf(CF_ASSIGNMENTS), replica_key(id, storage));
        }
        self.write(batch)?;

        state.by_path.remove(&key);
        state.repositories.remove(&id);
        for storage in &storages {
            state.replicas.remove(&(id, storage.clone()));
        }
        for storage in &assignments {
            state.assignments.remove(&(id, storage.clone()));
        }
        Ok((id, storages))
    }

    /// Remove a single replica row (used after a delete job completes).
    pub fn remove_replica(&self, repository_id: u64, storage: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_REPLICAS), replica_key(repository_id, storage));
        self.write(batch)?;
        state.replicas.remove(&(repository_id, storage.to_string()));
        Ok(())
    }

    /// Change the client-visible path. Re-checks uniqueness, rewrites
    /// the path on every queued and in-progress replication job, and —
    /// for repositories whose replica path tracks the relative path
    /// (registered out of band) — moves the replica path too.
    pub fn rename_repository(&self, repository_id: u64, new_relative_path: &str) -> Result<RenamePlan> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;

        let new_key = (record.virtual_storage.clone(), new_relative_path.to_string());
        if state.by_path.contains_key(&new_key) {
            return Err(Error::AlreadyExists(format!(
                "repository {}/{}",
                record.virtual_storage, new_relative_path
            )));
        }

        let tracks_relative_path = record.replica_path == record.relative_path;
        let plan = RenamePlan {
            old_replica_path: record.replica_path.clone(),
            new_replica_path: tracks_relative_path.then(|| new_relative_path.to_string()),
            storages: state
                .replicas
                .range((repository_id, String::new())..(repository_id + 1, String::new()))
                .map(|((_, storage), _)| storage.clone())
                .collect(),
        };

        let updated = RepositoryRecord {
            relative_path: new_relative_path.to_string(),
            replica_path: plan
                .new_replica_path
                .clone()
                .unwrap_or_else(|| record.replica_path.clone()),
            ..record.clone()
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_REPOSITORIES),
            repository_id.to_be_bytes(),
            encode(&updated)?,
        );

        // Bump every live queue row so later workers operate on the
        // current name.
        let mut bumped = Vec::new();
        for (id, job) in state.queue.iter() {
            if job.repository_id != repository_id
                || !matches!(job.state, JobState::Ready | JobState::InProgress)
            {
                continue;
            }
            let mut job = job.clone();
            job.relative_path = new_relative_path.to_string();
            if let Some(new_replica_path) = &plan.new_replica_path {
                if job.replica_path == plan.old_replica_path {
                    job.replica_path = new_replica_path.clone();
                }
            }
            batch.put_cf(self.cf(CF_QUEUE), id.to_be_bytes(), encode(&job)?);
            bumped.push(job);
        }

        self.write(batch)?;

        let old_key = (record.virtual_storage.clone(), record.relative_path.clone());
        state.by_path.remove(&old_key);
        state.by_path.insert(new_key, repository_id);
        state.repositories.insert(repository_id, updated);
        for job in bumped {
            state.queue.insert(job.id, job);
        }
        Ok(plan)
    }

    /// Replace the assignment set. Must be a non-empty subset of the
    /// virtual storage's configured storages.
    pub fn set_assignments(&self, repository_id: u64, storages: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;
        let configured: HashSet<&String> = self
            .configured_storages(&record.virtual_storage)?
            .iter()
            .collect();

        if storages.is_empty() {
            return Err(Error::InvalidArgument(
                "assignment set cannot be empty".into(),
            ));
        }
        let unique: HashSet<&String> = storages.iter().collect();
        if unique.len() != storages.len() {
            return Err(Error::InvalidArgument("duplicate storage in assignments".into()));
        }
        for storage in storages {
            if !configured.contains(storage) {
                return Err(Error::InvalidArgument(format!(
                    "storage {} not configured for virtual storage {}",
                    storage, record.virtual_storage
                )));
            }
        }

        let existing: Vec<String> = state
            .assignments
            .range((repository_id, String::new())..(repository_id + 1, String::new()))
            .map(|(_, storage)| storage.clone())
            .collect();

        let mut batch = WriteBatch::default();
        for storage in &existing {
            batch.delete_cf(self.cf(CF_ASSIGNMENTS), replica_key(repository_id, storage));
        }
        for storage in storages {
            batch.put_cf(
                self.cf(CF_ASSIGNMENTS),
                replica_key(repository_id, storage),
                encode(&(repository_id, storage.clone()))?,
            );
        }
        self.write(batch)?;

        for storage in existing {
            state.assignments.remove(&(repository_id, storage));
        }
        for storage in storages {
            state.assignments.insert((repository_id, storage.clone()));
        }
        Ok(())
    }

    /// Compare-and-set the primary. Returns false when the current
    /// primary no longer matches `expected`.
    pub fn set_primary(
        &self,
        repository_id: u64,
        expected: Option<&str>,
        new: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;
        if record.primary.as_deref() != expected {
            return Ok(false);
        }

        let updated = RepositoryRecord {
            primary: new,
            ..record.clone()
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_REPOSITORIES),
            repository_id.to_be_bytes(),
            encode(&updated)?,
        );
        self.write(batch)?;
        state.repositories.insert(repository_id, updated);
        Ok(true)
    }

    /// Repository ids for one virtual storage, ordered by relative path.
    pub fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<u64>> {
        self.configured_storages(virtual_storage)?;
        let state = self.state.lock().unwrap();
        let mut entries: Vec<(&String, u64)> = state
            .repositories
            .values()
            .filter(|r| r.virtual_storage == virtual_storage)
            .map(|r| (&r.relative_path, r.repository_id))
            .collect();
        entries.sort();
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    /// All repository ids, for the failover sweep.
    pub fn repository_ids(&self) -> Vec<u64> {
        self.state.lock().unwrap().repositories.keys().copied().collect()
    }

    // === Health operations ===

    /// Record one probe result from a router instance.
    pub fn record_health(
        &self,
        router: &str,
        virtual_storage: &str,
        storage: &str,
        reachable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (
            router.to_string(),
            virtual_storage.to_string(),
            storage.to_string(),
        );
        let previous = state.node_status.get(&key);
        let status = NodeStatus {
            router: router.to_string(),
            virtual_storage: virtual_storage.to_string(),
            storage: storage.to_string(),
            last_contact_at: now,
            last_seen_active_at: if reachable {
                Some(now)
            } else {
                previous.and_then(|s| s.last_seen_active_at)
            },
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_NODE_STATUS),
            node_status_key(router, virtual_storage, storage),
            encode(&status)?,
        );
        self.write(batch)?;
        state.node_status.insert(key, status);
        Ok(())
    }

    /// Effectively healthy storages of a virtual storage: those a strict
    /// majority of the active router instances saw alive within the
    /// freshness window. Routers count as active when they attempted any
    /// probe of this virtual storage within the window.
    pub fn healthy_storages(
        &self,
        virtual_storage: &str,
        freshness: Duration,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let configured = self.configured_storages(virtual_storage)?.to_vec();
        let state = self.state.lock().unwrap();
        let cutoff = now - chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::zero());

        let active_routers: HashSet<&String> = state
            .node_status
            .values()
            .filter(|s| s.virtual_storage == virtual_storage && s.last_contact_at >= cutoff)
            .map(|s| &s.router)
            .collect();
        if active_routers.is_empty() {
            return Ok(HashSet::new());
        }

        let mut healthy = HashSet::new();
        for storage in configured {
            let votes = state
                .node_status
                .values()
                .filter(|s| {
                    s.virtual_storage == virtual_storage
                        && s.storage == storage
                        && s.last_seen_active_at.map(|t| t >= cutoff).unwrap_or(false)
                })
                .count();
            if votes * 2 > active_routers.len() {
                healthy.insert(storage);
            }
        }
        Ok(healthy)
    }

    // === Operator views ===

    /// Full view of one repository given the effectively healthy set.
    pub fn repository_details(
        &self,
        repository_id: u64,
        healthy: &HashSet<String>,
    ) -> Result<RepositoryDetails> {
        let state = self.state.lock().unwrap();
        let record = state
            .repositories
            .get(&repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repository_id)))?;
        let configured = self.configured_storages(&record.virtual_storage)?;
        let replicas = Self::replicas_locked(&state, repository_id, configured);
        let max_generation = Self::max_generation_locked(&state, repository_id).unwrap_or(0);

        let replicas = replicas
            .into_iter()
            .map(|r| {
                let up_to_date = r.generation == Some(max_generation);
                let is_healthy = healthy.contains(&r.storage);
                ReplicaDetail {
                    valid_primary: r.assigned && is_healthy && up_to_date,
                    healthy: is_healthy,
                    storage: r.storage,
                    generation: r.generation,
                    assigned: r.assigned,
                    verified_at: r.verified_at,
                }
            })
            .collect();

        Ok(RepositoryDetails {
            repository_id,
            virtual_storage: record.virtual_storage.clone(),
            relative_path: record.relative_path.clone(),
            replica_path: record.replica_path.clone(),
            primary: record.primary.clone(),
            max_generation,
            replicas,
        })
    }

    /// Repositories with no assigned replica that is both up to date and
    /// healthy.
    pub fn get_unavailable(
        &self,
        virtual_storage: &str,
        healthy: &HashSet<String>,
    ) -> Result<Vec<RepositoryDetails>> {
        Ok(self
            .details_for(virtual_storage, healthy)?
            .into_iter()
            .filter(|d| !d.available())
            .collect())
    }

    /// Repositories that are available but have at least one assigned
    /// replica out of date or unhealthy. Includes unavailable ones, so
    /// this is the superset the operator sees with
    /// `-partially-unavailable`.
    pub fn get_partially_available(
        &self,
        virtual_storage: &str,
        healthy: &HashSet<String>,
    ) -> Result<Vec<RepositoryDetails>> {
        Ok(self
            .details_for(virtual_storage, healthy)?
            .into_iter()
            .filter(|d| !d.available() || d.partially_available())
            .collect())
    }

    fn details_for(
        &self,
        virtual_storage: &str,
        healthy: &HashSet<String>,
    ) -> Result<Vec<RepositoryDetails>> {
        let ids = self.list_repositories(virtual_storage)?;
        ids.into_iter()
            .map(|id| self.repository_details(id, healthy))
            .collect()
    }
}
