//! Dataloss report
//!
//! Enumerates repositories that are unavailable (no assigned replica is
//! both up to date and healthy) and, on request, partially unavailable
//! ones. The plaintext rendering is stable; operators diff it.

use crate::common::Result;
use crate::store::{PlacementStore, RepositoryDetails};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatalossReport {
    pub virtual_storage: String,
    pub include_partially_unavailable: bool,
    pub repositories: Vec<DatalossRepository>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatalossRepository {
    pub relative_path: String,
    pub unavailable: bool,
    pub primary: Option<String>,
    pub in_sync: Vec<InSyncReplica>,
    pub outdated: Vec<OutdatedReplica>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InSyncReplica {
    pub storage: String,
    pub assigned: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutdatedReplica {
    pub storage: String,
    /// Upper bound on missed changes; a replica that was never created
    /// counts as behind by the full history plus its creation
    pub behind_by: u64,
    pub assigned: bool,
    pub healthy: bool,
}

/// Build the report for one virtual storage.
pub fn gather(
    store: &PlacementStore,
    virtual_storage: &str,
    healthy: &HashSet<String>,
    include_partially_unavailable: bool,
) -> Result<DatalossReport> {
    let details = if include_partially_unavailable {
        store.get_partially_available(virtual_storage, healthy)?
    } else {
        store.get_unavailable(virtual_storage, healthy)?
    };

    Ok(DatalossReport {
        virtual_storage: virtual_storage.to_string(),
        include_partially_unavailable,
        repositories: details.iter().map(repository_entry).collect(),
    })
}

fn repository_entry(details: &RepositoryDetails) -> DatalossRepository {
    let mut in_sync = Vec::new();
    let mut outdated = Vec::new();

    for replica in &details.replicas {
        match replica.generation {
            Some(generation) if generation == details.max_generation => {
                in_sync.push(InSyncReplica {
                    storage: replica.storage.clone(),
                    assigned: replica.assigned,
                    healthy: replica.healthy,
                });
            }
            Some(generation) => outdated.push(OutdatedReplica {
                storage: replica.storage.clone(),
                behind_by: details.max_generation - generation,
                assigned: replica.assigned,
                healthy: replica.healthy,
            }),
            None => outdated.push(OutdatedReplica {
                storage: replica.storage.clone(),
                behind_by: details.max_generation + 1,
                assigned: replica.assigned,
                healthy: replica.healthy,
            }),
        }
    }

    DatalossRepository {
        relative_path: details.relative_path.clone(),
        unavailable: !details.available(),
        primary: details.primary.clone(),
        in_sync,
        outdated,
    }
}

/// Render one or more per-virtual-storage reports as plaintext.
pub fn render(reports: &[DatalossReport]) -> String {
    let mut out = String::new();
    for report in reports {
        out += &format!("Virtual storage: {}\n", report.virtual_storage);
        if report.repositories.is_empty() {
            if report.include_partially_unavailable {
                out += "  All repositories are fully available on all assigned storages!\n";
            } else {
                out += "  All repositories are available!\n";
            }
            continue;
        }

        out += "  Repositories:\n";
        for repo in &report.repositories {
            if repo.unavailable {
                out += &format!("    {} (unavailable):\n", repo.relative_path);
            } else {
                out += &format!("    {}:\n", repo.relative_path);
            }
            out += &format!(
                "      Primary: {}\n",
                repo.primary.as_deref().unwrap_or("No valid primary")
            );

            if !repo.in_sync.is_empty() {
                out += "      In-Sync Storages:\n";
                for replica in &repo.in_sync {
                    out += &format!(
                        "        {}{}\n",
                        replica.storage,
                        annotations(replica.assigned, replica.healthy)
                    );
                }
            }
            if !repo.outdated.is_empty() {
                out += "      Outdated Storages:\n";
                for replica in &repo.outdated {
                    let changes = if replica.behind_by == 1 {
                        "change"
                    } else {
                        "changes"
                    };
                    out += &format!(
                        "        {} is behind by {} {} or less{}\n",
                        replica.storage,
                        replica.behind_by,
                        changes,
                        annotations(replica.assigned, replica.healthy)
                    );
                }
            }
        }
    }
    out
}

fn annotations(assigned: bool, healthy: bool) -> String {
    let mut out = String::new();
    if assigned {
        out += ", assigned host";
    }
    if !healthy {
        out += ", unhealthy";
    }
    out
}
