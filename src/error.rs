//! Error types for KyroGraph.
//!
//! All errors in KyroGraph are strongly typed using thiserror.
//! The maintenance pipelines branch on these variants: the model error
//! classification drives backoff, and the merge errors carry the data-loss
//! guard.

use std::path::PathBuf;

use thiserror::Error;

use crate::node::NodeId;

/// Errors raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A node document could not be parsed.
    #[error("Failed to parse {path}: {reason}")]
    Parse {
        /// Path of the offending document.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested file does not exist.
    #[error("Not found: {0}")]
    NotFound(PathBuf),
}

impl StorageError {
    /// Wraps an I/O error with the path it concerned.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Three-way classification of external model failures.
///
/// Backoff logic branches on this: rate limits are retried under the shared
/// breaker, unreachable services abort every worker, everything else fails
/// the single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelErrorKind {
    /// The service asked us to slow down.
    RateLimited,
    /// The service could not be reached or timed out.
    Unreachable,
    /// Any other failure.
    Other,
}

/// Failure of a single external model call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
    },

    #[error("Model service unreachable: {message}")]
    Unreachable {
        message: String,
    },

    #[error("Model call failed: {message}")]
    Other {
        message: String,
    },
}

impl ModelError {
    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Creates an unreachable-service error.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Creates a generic model error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ModelErrorKind {
        match self {
            Self::RateLimited { .. } => ModelErrorKind::RateLimited,
            Self::Unreachable { .. } => ModelErrorKind::Unreachable,
            Self::Other { .. } => ModelErrorKind::Other,
        }
    }

    /// Returns true if the call may succeed after a shared backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// A model response that did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("Response contains no JSON object")]
    NoJson,

    #[error("Response JSON is malformed: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Response is missing required field '{field}'")]
    MissingField {
        field: String,
    },

    #[error("Response entry {index} is invalid: {reason}")]
    InvalidEntry {
        index: usize,
        reason: String,
    },
}

/// Merge execution failures.
///
/// The keeper variants are the data-loss guard: when one of them is
/// returned, no loser has been touched.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Keeper {keeper} has no known location")]
    KeeperUnknown {
        keeper: NodeId,
    },

    #[error("Keeper {keeper} at {path} could not be read: {source}")]
    KeeperUnreadable {
        keeper: NodeId,
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("Keeper {keeper} is archived and cannot absorb other nodes")]
    KeeperArchived {
        keeper: NodeId,
    },

    #[error("Keeper {keeper} at {path} could not be written: {source}")]
    KeeperWriteFailed {
        keeper: NodeId,
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("Merge plan for keeper {keeper} is invalid: {reason}")]
    InvalidPlan {
        keeper: NodeId,
        reason: String,
    },
}

impl MergeError {
    /// Returns the keeper of the offending plan.
    #[must_use]
    pub const fn keeper(&self) -> &NodeId {
        match self {
            Self::KeeperUnknown { keeper }
            | Self::KeeperUnreadable { keeper, .. }
            | Self::KeeperArchived { keeper }
            | Self::KeeperWriteFailed { keeper, .. }
            | Self::InvalidPlan { keeper, .. } => keeper,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Error)]
#[error("Invalid configuration '{field}': {reason}")]
pub struct ConfigError {
    /// Offending field.
    pub field: String,
    /// Why it was rejected.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The shared rate-limit breaker has tripped; no further model calls are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Rate-limit breaker aborted after sustained model failures")]
pub struct BreakerAborted;

/// Top-level error type for KyroGraph.
#[derive(Debug, Error)]
pub enum KyroGraphError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Aborted(#[from] BreakerAborted),

    #[error("Maintenance incomplete: {0}")]
    Maintenance(String),
}

impl KyroGraphError {
    /// Returns true if this error is the merge data-loss guard.
    #[must_use]
    pub const fn is_data_loss_guard(&self) -> bool {
        matches!(
            self,
            Self::Merge(MergeError::KeeperUnknown { .. } | MergeError::KeeperUnreadable { .. })
        )
    }
}

/// Result type alias for KyroGraph operations.
pub type KyroGraphResult<T> = Result<T, KyroGraphError>;
