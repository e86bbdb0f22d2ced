//! Error types surfaced at the store boundary

use crate::types::ShardId;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup by shard id missed.
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    /// Operation attempted after the store began closing.
    #[error("store is closed")]
    StoreClosed,

    /// A shard with this id is still being deleted; it cannot be recreated
    /// until the pending delete finishes.
    #[error("shard {0} is being deleted")]
    ShardDeletion(ShardId),

    /// Measurement or series deletes are refused while a database mixes
    /// shard index types; convert all shards to one index type first.
    #[error("cannot delete data: database {0} contains shards using multiple index types")]
    MultipleIndexTypes(String),

    /// A shard directory name did not parse as a 64-bit unsigned integer.
    #[error("{0:?} is not a valid shard id")]
    InvalidShardId(String),

    /// A computed deletion path was not where the directory layout says it
    /// must be; refusing to remove anything.
    #[error("invalid {scope} directory location: {path}")]
    PathEscape {
        /// What was being deleted, e.g. `"database"` or `"retention policy"`.
        scope: &'static str,
        /// The offending path.
        path: PathBuf,
    },

    /// A shard failed to open.
    #[error("failed to open shard {id}: {source}")]
    ShardOpen {
        /// Shard that failed.
        id: ShardId,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A shard failed to close.
    #[error("failed to close shard {id}: {source}")]
    ShardClose {
        /// Shard that failed.
        id: ShardId,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// An operation on a specific shard failed; wraps fan-out errors with
    /// the shard id for context.
    #[error("shard {id}: {source}")]
    Shard {
        /// Shard the failure belongs to.
        id: ShardId,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The series file for a database is corrupt or unreadable.
    #[error("series file for database {database}: {reason}")]
    SeriesFile {
        /// Database whose series file failed.
        database: String,
        /// Description of the failure.
        reason: String,
    },

    /// Two cardinality sketches could not be merged.
    #[error("cannot merge sketches: {0}")]
    SketchMerge(String),

    /// The operation's cancellation token fired before completion.
    #[error("operation canceled")]
    Canceled,

    /// A query argument was missing or an internal merge invariant broke.
    #[error("{0}")]
    Invalid(String),

    /// A storage engine reported a failure the store has no more specific
    /// variant for.
    #[error("engine: {0}")]
    Engine(String),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with the shard id it belongs to, for fan-out results.
    pub fn for_shard(id: ShardId, source: Error) -> Self {
        Error::Shard {
            id,
            source: Box::new(source),
        }
    }
}
