//! Error types for the sync core.
//!
//! Each layer has its own enum: `StoreError` for the local SQLite store,
//! `RemoteError` for the Supabase client, and `SyncError` for everything the
//! controller surfaces to callers.

use thiserror::Error;

/// Failures from the local persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("local store lock poisoned")]
    Poisoned,

    #[error("local store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },
}

/// Failures from the remote store client.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid remote URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to create HTTP client: {0}")]
    Client(String),

    #[error("network error communicating with {url}: {message}")]
    Network { url: String, message: String },

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid JSON from remote store: {0}")]
    Decode(String),

    #[error("{0}")]
    Rejected(String),
}

/// Errors surfaced by the sync controller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials blob missing or structurally invalid. Forces offline mode.
    #[error("remote configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Building the remote client failed. Forces offline mode.
    #[error("remote client construction failed: {0}")]
    RemoteConstruct(#[source] RemoteError),

    #[error("remote call failed: {0}")]
    RemoteCall(#[from] RemoteError),

    /// Local order blob could not be decoded.
    #[error("local data could not be parsed: {0}")]
    LocalParse(String),

    #[error(transparent)]
    LocalStore(#[from] StoreError),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("invalid product configuration: {0}")]
    InvalidProduct(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
