//! Error types for shard search execution.
//!
//! All failures are represented by the [`ShardSearchError`] enum. Most of them
//! are scoped to a single shard (or a single document within a shard) and are
//! accumulated into an [`ErrorSink`] rather than aborting the whole search.
//!
//! # Examples
//!
//! ```
//! use shardsearch::error::{ErrorSink, ShardSearchError};
//! use shardsearch::shard::ShardId;
//!
//! let sink = ErrorSink::new();
//! sink.record(ShardSearchError::open(ShardId(3), "index directory missing"));
//!
//! assert_eq!(sink.len(), 1);
//! assert_eq!(
//!     sink.snapshot()[0].to_string(),
//!     "Failed to open shard 3: index directory missing"
//! );
//! ```

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::shard::{FormatVersion, ShardId};

/// The main error type for shard search operations.
///
/// Errors are `Clone` because the same error is held by the shared sink and
/// handed back to the caller (and to the result sink) at completion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardSearchError {
    /// I/O errors raised while opening or reading a shard.
    #[error("I/O error: {0}")]
    Io(String),

    /// The query could not be compiled for a format version.
    #[error("Failed to build query for format version {version}: {message}")]
    QueryBuild {
        version: FormatVersion,
        message: String,
    },

    /// A searcher could not be opened for a shard.
    #[error("Failed to open shard {shard}: {message}")]
    Open { shard: ShardId, message: String },

    /// Matching failed part way through a shard.
    #[error("Error matching documents in shard {shard}: {message}")]
    Match { shard: ShardId, message: String },

    /// Stored fields could not be read for one document.
    #[error("Error extracting stored fields for doc {doc} in shard {shard}: {message}")]
    Extraction {
        shard: ShardId,
        doc: u32,
        message: String,
    },

    /// Shard data disagrees with its authoritative metadata.
    #[error("Shard {shard} is inconsistent: {message}")]
    Inconsistent { shard: ShardId, message: String },

    /// Something that was looked up does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Cooperative cancellation was observed. Not a failure.
    #[error("Search terminated")]
    Terminated,

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(String),

    /// Errors surfaced by collaborators as `anyhow` errors.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for operations that may fail with ShardSearchError.
pub type Result<T> = std::result::Result<T, ShardSearchError>;

impl From<io::Error> for ShardSearchError {
    fn from(err: io::Error) -> Self {
        ShardSearchError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ShardSearchError {
    fn from(err: serde_json::Error) -> Self {
        ShardSearchError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for ShardSearchError {
    fn from(err: anyhow::Error) -> Self {
        ShardSearchError::Other(format!("{err:#}"))
    }
}

impl ShardSearchError {
    /// Create a new query build error.
    pub fn query_build<S: Into<String>>(version: FormatVersion, msg: S) -> Self {
        ShardSearchError::QueryBuild {
            version,
            message: msg.into(),
        }
    }

    /// Create a new open error.
    pub fn open<S: Into<String>>(shard: ShardId, msg: S) -> Self {
        ShardSearchError::Open {
            shard,
            message: msg.into(),
        }
    }

    /// Create a new match error.
    pub fn matching<S: Into<String>>(shard: ShardId, msg: S) -> Self {
        ShardSearchError::Match {
            shard,
            message: msg.into(),
        }
    }

    /// Create a new extraction error.
    pub fn extraction<S: Into<String>>(shard: ShardId, doc: u32, msg: S) -> Self {
        ShardSearchError::Extraction {
            shard,
            doc,
            message: msg.into(),
        }
    }

    /// Create a new inconsistency error.
    pub fn inconsistent<S: Into<String>>(shard: ShardId, msg: S) -> Self {
        ShardSearchError::Inconsistent {
            shard,
            message: msg.into(),
        }
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        ShardSearchError::NotFound(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        ShardSearchError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        ShardSearchError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ShardSearchError::Internal(msg.into())
    }

    /// Check whether this is the cancellation condition.
    pub fn is_terminated(&self) -> bool {
        matches!(self, ShardSearchError::Terminated)
    }

    /// The shard this error is scoped to, if any.
    pub fn shard(&self) -> Option<ShardId> {
        match self {
            ShardSearchError::Open { shard, .. }
            | ShardSearchError::Match { shard, .. }
            | ShardSearchError::Extraction { shard, .. }
            | ShardSearchError::Inconsistent { shard, .. } => Some(*shard),
            _ => None,
        }
    }
}

/// Shared accumulator for errors raised anywhere in one search.
///
/// Cloning the sink yields another handle onto the same list.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    errors: Arc<Mutex<Vec<ShardSearchError>>>,
}

impl ErrorSink {
    /// Create a new empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Cancellation is not an error and is ignored.
    pub fn record(&self, error: ShardSearchError) {
        if error.is_terminated() {
            return;
        }
        self.errors.lock().push(error);
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Copy of every error recorded so far, in recording order.
    pub fn snapshot(&self) -> Vec<ShardSearchError> {
        self.errors.lock().clone()
    }
}
