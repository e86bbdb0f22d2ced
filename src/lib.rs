//! Shard store for a time-series database
//!
//! This crate implements the top-level coordinator of a time-series
//! database's on-disk data: a catalog of shards grouped under a
//! database / retention-policy namespace, per-database series files shared
//! by all shards of a database, and the machinery that keeps concurrent
//! writes, deletes, and lifecycle operations consistent:
//!
//! - parallel shard discovery and open, bounded by a per-core limiter
//! - create/delete of shards, retention policies, and databases under
//!   live traffic
//! - an epoch protocol serializing writes against conflicting deletes
//! - catalog queries (measurement names, tag keys, tag values,
//!   cardinality estimates) fanning out across shards and merging results
//! - a background monitor that frees idle shard resources
//!
//! Storage engines are pluggable behind the [`engine::Shard`] trait; an
//! in-memory reference engine ships in [`engine::memory`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod expr;
pub mod limiter;
pub mod series_file;
pub mod sketch;
pub mod store;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use store::Store;
pub use types::{Point, SeriesId, ShardId, TagSet, TimeRange};
