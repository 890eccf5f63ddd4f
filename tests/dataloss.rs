//! Operator dataloss report, end to end against the placement store.

mod common;

use common::Cluster;
use helmsman::ops::dataloss;
use helmsman::store::CreateRepository;

/// Mirror of the canonical operator scenario: two repositories, one
/// fully out of reach, one merely degraded, with an unassigned in-sync
/// replica on an unhealthy storage.
fn seed(cluster: &Cluster) {
    // repo-1: primary storage-1 at generation 1; storage-2 (assigned,
    // unhealthy) and storage-3 (unassigned) one change behind.
    let repo_1 = cluster.store.reserve_repository_id("vs1", "repository-1").unwrap();
    cluster
        .store
        .create_repository(CreateRepository {
            repository_id: repo_1,
            virtual_storage: "vs1".into(),
            relative_path: "repository-1".into(),
            replica_path: helmsman::common::derive_replica_path(repo_1),
            primary: Some("storage-1".into()),
            updated_secondaries: vec!["storage-2".into(), "storage-3".into()],
            outdated_secondaries: vec![],
            store_assignments: false,
            force: false,
        })
        .unwrap();
    cluster
        .store
        .set_assignments(repo_1, &["storage-1".into(), "storage-2".into()])
        .unwrap();
    cluster.store.set_generation(repo_1, "storage-1", 1).unwrap();

    // repo-2: primary storage-3; the only in-sync replica sits on the
    // unhealthy, unassigned storage-2; assigned storage-1 never got a
    // replica at all.
    let repo_2 = cluster.store.reserve_repository_id("vs1", "repository-2").unwrap();
    cluster
        .store
        .create_repository(CreateRepository {
            repository_id: repo_2,
            virtual_storage: "vs1".into(),
            relative_path: "repository-2".into(),
            replica_path: helmsman::common::derive_replica_path(repo_2),
            primary: Some("storage-3".into()),
            updated_secondaries: vec![],
            outdated_secondaries: vec![],
            store_assignments: false,
            force: false,
        })
        .unwrap();
    cluster
        .store
        .set_assignments(repo_2, &["storage-1".into(), "storage-3".into()])
        .unwrap();
    cluster.store.set_generation(repo_2, "storage-2", 1).unwrap();

    cluster.set_down("storage-2");
    cluster.sync_health();
}

#[tokio::test]
async fn test_dataloss_unavailable_only() {
    let cluster = Cluster::new(&["storage-1", "storage-2", "storage-3"]);
    seed(&cluster);

    let healthy = cluster.router.health.healthy_storages("vs1").unwrap();
    let report = dataloss::gather(&cluster.store, "vs1", &healthy, false).unwrap();

    assert_eq!(
        dataloss::render(&[report]),
        "Virtual storage: vs1\n\
         \x20 Repositories:\n\
         \x20   repository-2 (unavailable):\n\
         \x20     Primary: storage-3\n\
         \x20     In-Sync Storages:\n\
         \x20       storage-2, unhealthy\n\
         \x20     Outdated Storages:\n\
         \x20       storage-1 is behind by 2 changes or less, assigned host\n\
         \x20       storage-3 is behind by 1 change or less, assigned host\n"
    );
}

#[tokio::test]
async fn test_dataloss_partially_unavailable() {
    let cluster = Cluster::new(&["storage-1", "storage-2", "storage-3"]);
    seed(&cluster);

    let healthy = cluster.router.health.healthy_storages("vs1").unwrap();
    let report = dataloss::gather(&cluster.store, "vs1", &healthy, true).unwrap();

    assert_eq!(
        dataloss::render(&[report]),
        "Virtual storage: vs1\n\
         \x20 Repositories:\n\
         \x20   repository-1:\n\
         \x20     Primary: storage-1\n\
         \x20     In-Sync Storages:\n\
         \x20       storage-1, assigned host\n\
         \x20     Outdated Storages:\n\
         \x20       storage-2 is behind by 1 change or less, assigned host, unhealthy\n\
         \x20       storage-3 is behind by 1 change or less\n\
         \x20   repository-2 (unavailable):\n\
         \x20     Primary: storage-3\n\
         \x20     In-Sync Storages:\n\
         \x20       storage-2, unhealthy\n\
         \x20     Outdated Storages:\n\
         \x20       storage-1 is behind by 2 changes or less, assigned host\n\
         \x20       storage-3 is behind by 1 change or less, assigned host\n"
    );
}

/// A repository whose primary was demoted and never re-elected renders
/// the no-primary marker.
#[tokio::test]
async fn test_dataloss_without_primary() {
    let cluster = Cluster::new(&["storage-1", "storage-2"]);
    let repo = cluster.create_repo("repository-1", "storage-1", &[], &["storage-2"]);
    cluster
        .store
        .set_primary(repo, Some("storage-1"), None)
        .unwrap();
    cluster.set_down("storage-1");
    cluster.sync_health();

    let healthy = cluster.router.health.healthy_storages("vs1").unwrap();
    let report = dataloss::gather(&cluster.store, "vs1", &healthy, false).unwrap();

    assert_eq!(
        dataloss::render(&[report]),
        "Virtual storage: vs1\n\
         \x20 Repositories:\n\
         \x20   repository-1 (unavailable):\n\
         \x20     Primary: No valid primary\n\
         \x20     In-Sync Storages:\n\
         \x20       storage-1, assigned host, unhealthy\n\
         \x20     Outdated Storages:\n\
         \x20       storage-2 is behind by 1 change or less, assigned host\n"
    );
}

#[tokio::test]
async fn test_dataloss_all_available() {
    let cluster = Cluster::new(&["storage-1", "storage-2"]);
    let repo = cluster.create_repo("repository-1", "storage-1", &["storage-2"], &[]);
    cluster.sync_health();

    let healthy = cluster.router.health.healthy_storages("vs1").unwrap();
    let unavailable = dataloss::gather(&cluster.store, "vs1", &healthy, false).unwrap();
    assert_eq!(
        dataloss::render(&[unavailable]),
        "Virtual storage: vs1\n  All repositories are available!\n"
    );

    let partially = dataloss::gather(&cluster.store, "vs1", &healthy, true).unwrap();
    assert_eq!(
        dataloss::render(&[partially]),
        "Virtual storage: vs1\n  All repositories are fully available on all assigned storages!\n"
    );
    let _ = repo;
}

/// The dataloss view and the dispatcher agree on availability: a
/// repository the report calls unavailable rejects every mutator with
/// Unavailable.
#[tokio::test]
async fn test_availability_matches_dispatcher() {
    let cluster = Cluster::new(&["storage-1", "storage-2", "storage-3"]);
    seed(&cluster);

    let healthy = cluster.router.health.healthy_storages("vs1").unwrap();
    let report = dataloss::gather(&cluster.store, "vs1", &healthy, false).unwrap();
    assert_eq!(report.repositories.len(), 1);
    assert_eq!(report.repositories[0].relative_path, "repository-2");

    let err = cluster
        .dispatch("write_ref", "repository-2", b"refs/heads/main")
        .await
        .unwrap_err();
    assert!(matches!(err, helmsman::Error::Unavailable(_)));

    // The degraded-but-available repository still accepts mutators
    cluster
        .dispatch("write_ref", "repository-1", b"refs/heads/main")
        .await
        .unwrap();
}
