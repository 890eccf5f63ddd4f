//! # helmsman
//!
//! A cluster router and replication manager for a sharded
//! repository-hosting service:
//! - Virtual storages hide physical replica placement from clients
//! - Per-mutator voting decides which replicas committed identically
//! - A persistent replication queue repairs lagging replicas
//! - Per-repository failover promotes a healthy, up-to-date primary
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               Router                     │
//! │  dispatcher ─── vote coordinator         │
//! │      │                │                  │
//! │  placement store (RocksDB)               │
//! │      │                                   │
//! │  replication scheduler ─── failover      │
//! └──────┬───────────┬───────────┬───────────┘
//!        │           │           │
//!  ┌─────▼─────┐ ┌───▼───────┐ ┌─▼─────────┐
//!  │ storage-1 │ │ storage-2 │ │ storage-3 │
//!  │ (replica) │ │ (replica) │ │ (replica) │
//!  └───────────┘ └───────────┘ └───────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the router
//! ```bash
//! helmsman-router serve \
//!   --name router-1 \
//!   --bind 0.0.0.0:5000 \
//!   --db ./router-data \
//!   --config ./helmsman.json
//! ```
//!
//! ### Operator CLI
//! ```bash
//! helmsman dataloss --virtual-storage vs1
//! helmsman metadata --repository-id 42
//! helmsman track-repository --virtual-storage vs1 --repository a/b --authoritative-storage st-1
//! helmsman remove-repository --virtual-storage vs1 --repository a/b
//! helmsman accept-dataloss --virtual-storage vs1 --repository a/b --authoritative-storage st-1
//! ```

pub mod common;
pub mod ops;
pub mod replication;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use router::Router;
pub use store::PlacementStore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
