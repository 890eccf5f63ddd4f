//! Operator tooling behind the CLI and the admin API

pub mod dataloss;
pub mod metadata;
pub mod track;

pub use dataloss::DatalossReport;
pub use metadata::MetadataReport;
pub use track::{accept_dataloss, remove_repository, track_repository};
