//! Error types for helmsman

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Routing Errors ===
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // === Vote Errors ===
    #[error("transaction {transaction_id} aborted in {phase} phase")]
    VoteAborted { transaction_id: u64, phase: String },

    #[error("transaction {0} stopped")]
    VoteStopped(u64),

    #[error("vote deadline exceeded for transaction {0}")]
    VoteDeadline(u64),

    // === Placement Errors ===
    #[error("insufficient storages: need {needed}, have {available}")]
    InsufficientStorages { needed: usize, available: usize },

    #[error("no healthy storages available")]
    NoHealthyStorages,

    // === Store Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("placement store corrupted: {0}")]
    Corrupted(String),

    // === Network Errors ===
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle ===
    #[error("canceled: {0}")]
    Canceled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_)
                | Error::ConnectionFailed(_)
                | Error::DeadlineExceeded(_)
                | Error::NoHealthyStorages
                | Error::Internal(_)
        )
    }

    /// Is this terminal for a replication job (retrying cannot help)?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InvalidArgument(_) | Error::PermissionDenied(_)
        )
    }

    /// Convert to HTTP status code for the admin surface
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::FailedPrecondition(_) | Error::VoteAborted { .. } => {
                StatusCode::PRECONDITION_FAILED
            }
            Error::Unavailable(_) | Error::NoHealthyStorages | Error::InsufficientStorages { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::DeadlineExceeded(_) | Error::VoteDeadline(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
