//! Out-of-band repository tooling
//!
//! `track_repository` registers a repository created behind the
//! router's back, `remove_repository` retires one, and
//! `accept_dataloss` makes a named replica's contents authoritative
//! after an outage.

use crate::common::{Error, Metrics, Result, METRICS};
use crate::store::{ChangeType, CreateRepository, NewJob, PlacementStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResult {
    pub repository_id: u64,
    /// False when the repository was already tracked
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResult {
    pub repository_id: u64,
    /// Storages a deletion job was enqueued for
    pub storages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResult {
    pub repository_id: u64,
    pub authoritative_storage: String,
    /// The generation the authoritative replica now holds
    pub generation: u64,
}

/// Register an out-of-band-created repository. Idempotent: tracking an
/// already-tracked repository returns its id without changing anything.
/// Every configured storage is assigned; the authoritative storage
/// becomes primary and the others are repaired from it.
pub fn track_repository(
    store: &PlacementStore,
    virtual_storage: &str,
    relative_path: &str,
    authoritative_storage: &str,
) -> Result<TrackResult> {
    let configured = store.configured_storages(virtual_storage)?.to_vec();
    if !configured.iter().any(|s| s.as_str() == authoritative_storage) {
        return Err(Error::InvalidArgument(format!(
            "storage {} not configured for virtual storage {}",
            authoritative_storage, virtual_storage
        )));
    }

    if let Ok(existing) = store.get_repository_by_path(virtual_storage, relative_path) {
        tracing::info!(
            repository_id = existing.repository_id,
            "repository already tracked"
        );
        return Ok(TrackResult {
            repository_id: existing.repository_id,
            created: false,
        });
    }

    let repository_id = store.reserve_repository_id(virtual_storage, relative_path)?;
    let outdated: Vec<String> = configured
        .iter()
        .filter(|s| *s != authoritative_storage)
        .cloned()
        .collect();

    store.create_repository(CreateRepository {
        repository_id,
        virtual_storage: virtual_storage.to_string(),
        relative_path: relative_path.to_string(),
        // The repository already sits at its client-visible path on disk
        replica_path: relative_path.to_string(),
        primary: Some(authoritative_storage.to_string()),
        updated_secondaries: vec![],
        outdated_secondaries: outdated.clone(),
        store_assignments: true,
        force: false,
    })?;

    for target in &outdated {
        enqueue(
            store,
            ChangeType::Create,
            virtual_storage,
            repository_id,
            relative_path,
            Some(authoritative_storage),
            target,
        );
    }

    Ok(TrackResult {
        repository_id,
        created: true,
    })
}

/// Delete the placement record and enqueue deletion jobs for every
/// storage that held a replica.
pub fn remove_repository(
    store: &PlacementStore,
    virtual_storage: &str,
    relative_path: &str,
) -> Result<RemoveResult> {
    let record = store.get_repository_by_path(virtual_storage, relative_path)?;
    let (repository_id, storages) = store.delete_repository(virtual_storage, relative_path)?;

    for target in &storages {
        store
            .enqueue(NewJob {
                change_type: ChangeType::Delete,
                virtual_storage: virtual_storage.to_string(),
                repository_id,
                relative_path: relative_path.to_string(),
                replica_path: record.replica_path.clone(),
                source_storage: None,
                target_storage: target.clone(),
                rename_to: None,
            })
            .map(|_| Metrics::incr(&METRICS.jobs_enqueued))?;
    }

    Ok(RemoveResult {
        repository_id,
        storages,
    })
}

/// Declare one storage's copy authoritative: its generation is raised
/// above every other replica's, and repair jobs converge the rest of
/// the assignment set onto it. Generations never decrease, so
/// authority is expressed by outranking instead of resetting.
pub fn accept_dataloss(
    store: &PlacementStore,
    virtual_storage: &str,
    relative_path: &str,
    authoritative_storage: &str,
) -> Result<AcceptResult> {
    let record = store.get_repository_by_path(virtual_storage, relative_path)?;
    let repository_id = record.repository_id;
    let max = store.max_generation(repository_id)?.unwrap_or(0);

    let new_generation = max + 1;
    store.set_generation(repository_id, authoritative_storage, new_generation)?;
    store.set_primary(
        repository_id,
        record.primary.as_deref(),
        Some(authoritative_storage.to_string()),
    )?;

    for replica in store.get_replicas(repository_id)? {
        if replica.storage == authoritative_storage || !replica.assigned {
            continue;
        }
        enqueue(
            store,
            if replica.generation.is_some() {
                ChangeType::Update
            } else {
                ChangeType::Create
            },
            virtual_storage,
            repository_id,
            relative_path,
            Some(authoritative_storage),
            &replica.storage,
        );
    }

    Ok(AcceptResult {
        repository_id,
        authoritative_storage: authoritative_storage.to_string(),
        generation: new_generation,
    })
}

fn enqueue(
    store: &PlacementStore,
    change_type: ChangeType,
    virtual_storage: &str,
    repository_id: u64,
    relative_path: &str,
    source_storage: Option<&str>,
    target_storage: &str,
) {
    let replica_path = match store.get_repository(repository_id) {
        Ok(record) => record.replica_path,
        Err(e) => {
            tracing::error!(repository_id, "cannot enqueue repair: {}", e);
            return;
        }
    };
    match store.enqueue(NewJob {
        change_type,
        virtual_storage: virtual_storage.to_string(),
        repository_id,
        relative_path: relative_path.to_string(),
        replica_path,
        source_storage: source_storage.map(|s| s.to_string()),
        target_storage: target_storage.to_string(),
        rename_to: None,
    }) {
        Ok(_) => Metrics::incr(&METRICS.jobs_enqueued),
        Err(e) => tracing::error!(
            repository_id,
            target = %target_storage,
            "failed to enqueue {} job: {}",
            change_type,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobState;
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

    #[test]
    fn test_track_repository() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let result = track_repository(&store, "vs1", "oob/repo", "st-2").unwrap();
        assert!(result.created);

        let record = store.get_repository_by_path("vs1", "oob/repo").unwrap();
        assert_eq!(record.primary.as_deref(), Some("st-2"));
        assert_eq!(record.replica_path, "oob/repo");

        // All configured storages assigned, repairs queued for the others
        let replicas = store.get_replicas(result.repository_id).unwrap();
        assert_eq!(replicas.len(), 3);
        assert!(replicas.iter().all(|r| r.assigned));
        let jobs = store.jobs_for_repository(result.repository_id);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.change_type == ChangeType::Create));
    }

    #[test]
    fn test_track_repository_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = track_repository(&store, "vs1", "oob/repo", "st-2").unwrap();
        let second = track_repository(&store, "vs1", "oob/repo", "st-2").unwrap();
        assert_eq!(first.repository_id, second.repository_id);
        assert!(!second.created);

        // No duplicated replica rows or jobs
        assert_eq!(store.get_replicas(first.repository_id).unwrap().len(), 3);
        assert_eq!(store.jobs_for_repository(first.repository_id).len(), 2);
    }

    #[test]
    fn test_track_repository_unknown_storage() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            track_repository(&store, "vs1", "oob/repo", "st-9").unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_remove_repository() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let tracked = track_repository(&store, "vs1", "oob/repo", "st-2").unwrap();

        let result = remove_repository(&store, "vs1", "oob/repo").unwrap();
        assert_eq!(result.repository_id, tracked.repository_id);
        assert_eq!(result.storages, vec!["st-2".to_string()]);

        assert!(store.get_repository_by_path("vs1", "oob/repo").is_err());
        let jobs = store.jobs_for_repository(result.repository_id);
        let deletes: Vec<_> = jobs
            .iter()
            .filter(|j| j.change_type == ChangeType::Delete && j.state == JobState::Ready)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].target_storage, "st-2");
    }

    #[test]
    fn test_accept_dataloss_outranks() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let tracked = track_repository(&store, "vs1", "oob/repo", "st-1").unwrap();
        let id = tracked.repository_id;

        // st-1 advanced to 2; st-2 diverged at 1 and is chosen as truth
        store.increment_generation(id, "st-1", &[], 0).unwrap();
        store.increment_generation(id, "st-1", &[], 1).unwrap();
        store.set_generation(id, "st-2", 1).unwrap();

        let result = accept_dataloss(&store, "vs1", "oob/repo", "st-2").unwrap();
        assert_eq!(result.generation, 3);
        assert_eq!(store.max_generation(id).unwrap(), Some(3));
        assert_eq!(
            store.get_repository(id).unwrap().primary.as_deref(),
            Some("st-2")
        );

        // Everyone else converges onto st-2
        let jobs = store.jobs_for_repository(id);
        let repair_targets: Vec<&str> = jobs
            .iter()
            .filter(|j| {
                j.state == JobState::Ready && j.source_storage.as_deref() == Some("st-2")
            })
            .map(|j| j.target_storage.as_str())
            .collect();
        assert!(repair_targets.contains(&"st-1"));
        assert!(repair_targets.contains(&"st-3"));
    }
}
