//! Hashing utilities for helmsman
//!
//! - BLAKE3 for vote hashes over reference-update records
//! - HRW (Highest Random Weight) for deterministic storage selection
//! - Replica path derivation for new repositories

use blake3::Hasher;

/// A single pending reference update, as reported by a backend mid-RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub ref_name: String,
    pub old_oid: String,
    pub new_oid: String,
}

/// Compute the vote hash over a set of reference updates.
///
/// Records are hashed in the order given, one canonical line per update:
/// `<old_oid> <new_oid> <ref_name>\n`. Two backends that stage identical
/// updates in identical order produce identical hashes.
pub fn vote_hash(updates: &[RefUpdate]) -> String {
    let mut hasher = Hasher::new();
    for update in updates {
        hasher.update(update.old_oid.as_bytes());
        hasher.update(b" ");
        hasher.update(update.new_oid.as_bytes());
        hasher.update(b" ");
        hasher.update(update.ref_name.as_bytes());
        hasher.update(b"\n");
    }
    format!("{}", hasher.finalize())
}

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    format!("{}", blake3::hash(data))
}

/// HRW (Highest Random Weight) hashing for storage selection
///
/// Given a key and a set of storages, returns storages sorted by their
/// weight (deterministic based on key). This keeps placement stable as
/// the healthy set changes.
pub fn hrw_hash(key: &str, storages: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = storages
        .iter()
        .map(|storage| {
            let combined = format!("{}{}", key, storage);
            let hash = blake3::hash(combined.as_bytes());
            let weight = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
            (storage.clone(), weight)
        })
        .collect();

    // Sort by weight (descending); tie-break by name for determinism
    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    weights.into_iter().map(|(storage, _)| storage).collect()
}

/// Select N storages for a new repository using HRW hashing
pub fn select_storages(key: &str, storages: &[String], n: usize) -> Vec<String> {
    let sorted = hrw_hash(key, storages);
    sorted.into_iter().take(n).collect()
}

/// Derive the on-disk replica path for a repository id.
///
/// The client-visible relative path is never used on disk; replicas live
/// under a two-level prefix tree keyed by the repository id:
/// `@cluster/repositories/aa/bb/<id>`.
pub fn derive_replica_path(repository_id: u64) -> String {
    let hash = blake3::hash(repository_id.to_string().as_bytes());
    let bytes = hash.as_bytes();
    format!(
        "@cluster/repositories/{:02x}/{:02x}/{}",
        bytes[0], bytes[1], repository_id
    )
}
