//! Error types, one enum per layer.
//!
//! Classification:
//! - usage errors (`NotRunning`, `InvalidTransition`, `NotLocal`,
//!   `DestinationExists`) are caller bugs and are never retried;
//! - `StoreError` is surfaced as-is, retry policy belongs to the task layer;
//! - `StateError::Missing` and `StateError::Corrupt` are kept apart because
//!   absence is normal and corruption needs an operator.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no object with key '{0}'")]
    NotFound(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("backing store I/O failed for '{key}'")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            key: key.into(),
            source,
        }
    }
}

/// Errors from reading or writing an atomic state record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state record {path} does not exist")]
    Missing { path: PathBuf },

    #[error("state record {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state record {path} could not be encoded")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state record {path}: I/O failed")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from registering deferred handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("deferred handler '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Errors from capturing or invoking a deferred function.
#[derive(Debug, Error)]
pub enum DeferredError {
    #[error("no deferred handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("deferred action could not be encoded or decoded")]
    Codec(#[from] serde_json::Error),

    #[error("deferred handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("removing {path} failed")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a file staging context.
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("'{operation}' is only allowed while the task is running")]
    NotRunning { operation: &'static str },

    #[error("cannot {operation} a file store in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("node crash flag is set: {0}")]
    Aborted(String),

    #[error("attempting to delete a non-local file '{0}'")]
    NotLocal(String),

    #[error("file {0} exists, cannot overwrite")]
    DestinationExists(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Deferred(#[from] DeferredError),

    #[error("controller rejected the completion")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("local I/O failed on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileStoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FileStoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
