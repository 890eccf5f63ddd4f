//! Repository metadata report

use crate::common::Result;
use crate::store::PlacementStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReport {
    pub repository_id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub replica_path: String,
    pub primary: Option<String>,
    pub generation: u64,
    pub replicas: Vec<ReplicaMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    pub storage: String,
    pub assigned: bool,
    pub generation: Option<u64>,
    pub behind_by: u64,
    pub healthy: bool,
    pub valid_primary: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Build the report for one repository.
pub fn gather(
    store: &PlacementStore,
    repository_id: u64,
    healthy: &HashSet<String>,
) -> Result<MetadataReport> {
    let details = store.repository_details(repository_id, healthy)?;
    Ok(MetadataReport {
        repository_id: details.repository_id,
        virtual_storage: details.virtual_storage.clone(),
        relative_path: details.relative_path.clone(),
        replica_path: details.replica_path.clone(),
        primary: details.primary.clone(),
        generation: details.max_generation,
        replicas: details
            .replicas
            .iter()
            .map(|r| ReplicaMetadata {
                storage: r.storage.clone(),
                assigned: r.assigned,
                generation: r.generation,
                behind_by: details.max_generation - r.generation.unwrap_or(0),
                healthy: r.healthy,
                valid_primary: r.valid_primary,
                verified_at: r.verified_at,
            })
            .collect(),
    })
}

/// Render the report as plaintext.
pub fn render(report: &MetadataReport) -> String {
    let mut out = String::new();
    out += &format!("Repository ID: {}\n", report.repository_id);
    out += &format!("Virtual Storage: {:?}\n", report.virtual_storage);
    out += &format!("Relative Path: {:?}\n", report.relative_path);
    out += &format!("Replica Path: {:?}\n", report.replica_path);
    out += &format!(
        "Primary: {:?}\n",
        report.primary.as_deref().unwrap_or_default()
    );
    out += &format!("Generation: {}\n", report.generation);
    out += "Replicas:\n";
    for replica in &report.replicas {
        out += &format!("- Storage: {:?}\n", replica.storage);
        out += &format!("  Assigned: {}\n", replica.assigned);
        out += &format!("  Generation: {}\n", generation_line(replica));
        out += &format!("  Healthy: {}\n", replica.healthy);
        out += &format!("  Valid Primary: {}\n", replica.valid_primary);
        out += &format!(
            "  Verified At: {}\n",
            replica
                .verified_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unverified".to_string())
        );
    }
    out
}

fn generation_line(replica: &ReplicaMetadata) -> String {
    match replica.generation {
        None => "replica not yet created".to_string(),
        Some(generation) if replica.behind_by == 0 => {
            format!("{}, fully up to date", generation)
        }
        Some(generation) => format!("{}, behind by {} changes", generation, replica.behind_by),
    }
}
