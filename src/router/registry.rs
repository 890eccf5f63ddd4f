//! Operation registry
//!
//! Classifies each RPC by name. Routing depends only on this tag, never
//! on the request payload.

use crate::common::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcType {
    /// Read-only; routes to a single up-to-date replica
    Accessor,
    /// State-changing; routes to the primary and up-to-date secondaries
    /// under the vote protocol
    Mutator,
    /// Housekeeping; does not move generations
    Maintenance,
    /// Creates the repository on a fresh replica set
    RepositoryCreation,
    /// Removes the repository everywhere
    RepositoryDeletion,
    /// Changes the client-visible path
    RepositoryRename,
}

pub struct OperationRegistry {
    operations: HashMap<&'static str, RpcType>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        let mut operations = HashMap::new();

        for op in [
            "find_commit",
            "get_blob",
            "get_tree_entries",
            "find_refs",
            "upload_pack",
            "calculate_checksum",
            "repository_exists",
        ] {
            operations.insert(op, RpcType::Accessor);
        }
        for op in [
            "receive_pack",
            "update_references",
            "write_ref",
            "apply_patch",
            "merge_branch",
            "squash",
        ] {
            operations.insert(op, RpcType::Mutator);
        }
        for op in ["gc", "repack", "pack_refs", "prune"] {
            operations.insert(op, RpcType::Maintenance);
        }
        operations.insert("create_repository", RpcType::RepositoryCreation);
        operations.insert("remove_repository", RpcType::RepositoryDeletion);
        operations.insert("rename_repository", RpcType::RepositoryRename);

        Self { operations }
    }
}

impl OperationRegistry {
    pub fn classify(&self, operation: &str) -> Result<RpcType> {
        self.operations
            .get(operation)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown operation: {}", operation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let registry = OperationRegistry::default();
        assert_eq!(registry.classify("find_commit").unwrap(), RpcType::Accessor);
        assert_eq!(registry.classify("write_ref").unwrap(), RpcType::Mutator);
        assert_eq!(registry.classify("gc").unwrap(), RpcType::Maintenance);
        assert_eq!(
            registry.classify("create_repository").unwrap(),
            RpcType::RepositoryCreation
        );
        assert!(registry.classify("no_such_operation").is_err());
    }
}
