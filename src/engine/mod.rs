//! Storage engine capability traits
//!
//! The store treats a shard as an opaque engine behind the [`Shard`] trait
//! and reads its catalog through [`Index`]. Concrete engines are plugged in
//! through a [`ShardBuilder`]; the in-memory reference engine lives in
//! [`memory`].

pub mod memory;

use crate::error::Result;
use crate::expr::Expr;
use crate::limiter::{Fixed, Rate};
use crate::series_file::SeriesFile;
use crate::sketch::Sketch;
use crate::types::{Point, SeriesId, ShardId, Statistic, TagSet};
use async_trait::async_trait;
use croaring::Treemap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Shared resources and knobs handed to every shard engine.
#[derive(Clone)]
pub struct EngineOptions {
    /// Bounds simultaneous shard opens; width = core count.
    pub open_limiter: Fixed,
    /// Bounds simultaneous compactions across all shards.
    pub compaction_limiter: Fixed,
    /// Byte-rate limit for compaction throughput; `None` = unlimited.
    pub compaction_throughput: Option<Rate>,
    /// Open shards with compactions disabled.
    pub compactions_disabled: bool,
}

impl EngineOptions {
    /// Options with default limiter widths, for tests and standalone use.
    pub fn new() -> Self {
        let cores = num_cpus::get();
        Self {
            open_limiter: Fixed::new(cores),
            compaction_limiter: Fixed::new((cores / 2).max(1)),
            compaction_throughput: None,
            compactions_disabled: false,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("open_limiter", &self.open_limiter)
            .field("compaction_limiter", &self.compaction_limiter)
            .field("throughput_limited", &self.compaction_throughput.is_some())
            .field("compactions_disabled", &self.compactions_disabled)
            .finish()
    }
}

/// Everything a builder needs to construct one shard.
#[derive(Clone)]
pub struct ShardContext {
    /// Shard id, unique across the store.
    pub id: ShardId,
    /// Owning database.
    pub database: String,
    /// Owning retention policy.
    pub retention_policy: String,
    /// Shard data directory.
    pub path: PathBuf,
    /// Shard write-ahead-log directory.
    pub wal_path: PathBuf,
    /// The database's shared series catalog.
    pub series_file: Arc<SeriesFile>,
    /// Shared engine resources.
    pub options: EngineOptions,
}

/// Constructs shard engines for the store.
pub trait ShardBuilder: Send + Sync {
    /// Build a closed shard; the store opens it afterwards.
    fn build(&self, ctx: ShardContext) -> Arc<dyn Shard>;
}

/// The storage engine for one `(database, retention policy, id)` triple.
#[async_trait]
pub trait Shard: Send + Sync {
    /// Shard id.
    fn id(&self) -> ShardId;
    /// Owning database name.
    fn database(&self) -> &str;
    /// Owning retention policy name.
    fn retention_policy(&self) -> &str;
    /// Data directory.
    fn path(&self) -> &Path;
    /// WAL directory.
    fn wal_path(&self) -> &Path;
    /// Tag identifying the index implementation, e.g. `"inmem"`.
    fn index_type(&self) -> &str;

    /// Open the engine. Idempotent.
    async fn open(&self) -> Result<()>;
    /// Close the engine and release its resources.
    async fn close(&self) -> Result<()>;
    /// Allow or refuse reads and writes.
    fn set_enabled(&self, enabled: bool);
    /// Allow or pause background compactions.
    fn set_compactions_enabled(&self, enabled: bool);
    /// True when the shard has no recent write activity.
    fn is_idle(&self) -> bool;
    /// Release memory held for a cold shard.
    async fn free(&self) -> Result<()>;

    /// Append a batch of points.
    async fn write_points(&self, points: &[Point]) -> Result<()>;
    /// Remove a measurement and all of its series.
    async fn delete_measurement(&self, name: &str) -> Result<()>;
    /// Remove data for the given series inside `[min, max]`. Series whose
    /// whole history is covered are dropped from the index.
    async fn delete_series_range(&self, ids: &[SeriesId], min: i64, max: i64) -> Result<()>;

    /// The shard's catalog index.
    fn index(&self) -> Arc<dyn Index>;
    /// The shared series catalog this shard writes to.
    fn series_file(&self) -> Arc<SeriesFile>;
    /// Number of live series in the shard.
    fn series_n(&self) -> i64;
    /// Bytes of shard data on disk, excluding the WAL.
    async fn disk_size(&self) -> Result<i64>;
    /// Monitoring statistics, merged with the caller's tags.
    fn statistics(&self, tags: &BTreeMap<String, String>) -> Vec<Statistic>;
    /// `(items, tombstones)` sketches over series keys.
    fn series_sketches(&self) -> Result<(Sketch, Sketch)>;
    /// `(items, tombstones)` sketches over measurement names.
    fn measurements_sketches(&self) -> Result<(Sketch, Sketch)>;

    /// Materialize a snapshot of the shard and return its path. The caller
    /// removes the returned path when done.
    async fn create_snapshot(&self, skip_cache_ok: bool) -> Result<PathBuf>;
    /// Stream shard data changed since `since` to `w`.
    async fn backup(
        &self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
        path: &str,
        since: i64,
    ) -> Result<()>;
    /// Stream shard data inside `[start, end]` to `w`.
    async fn export(
        &self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
        path: &str,
        start: i64,
        end: i64,
    ) -> Result<()>;
    /// Replace shard contents from a backup stream.
    async fn restore(&self, r: &mut (dyn AsyncRead + Send + Unpin), path: &str) -> Result<()>;
    /// Merge a backup stream into the shard, keeping existing data.
    async fn import(&self, r: &mut (dyn AsyncRead + Send + Unpin), path: &str) -> Result<()>;
    /// A stable digest of the shard's contents.
    async fn digest(&self) -> Result<Vec<u8>>;
}

/// Read access to one shard's series/measurement catalog.
pub trait Index: Send + Sync {
    /// Bitset of every live series id in the shard.
    fn series_id_set(&self) -> Treemap;
    /// Sorted live measurement names.
    fn measurement_names(&self) -> Vec<String>;
    /// Series ids belonging to a measurement.
    fn measurement_series_ids(&self, name: &str) -> Treemap;
    /// Series ids of a measurement whose tags satisfy `expr`; comparisons
    /// undecidable from tags keep the series.
    fn measurement_series_ids_by_expr(&self, name: &str, expr: Option<&Expr>) -> Treemap;
    /// Sorted tag keys of a measurement.
    fn tag_keys(&self, name: &str) -> Vec<String>;
    /// Sorted values of one tag key within a measurement.
    fn tag_values(&self, name: &str, key: &str) -> Vec<String>;
    /// Measurement and tags of a series id, if it is live in this shard.
    fn series_tags(&self, id: SeriesId) -> Option<(String, TagSet)>;
    /// Approximate in-memory footprint of the index.
    fn bytes(&self) -> usize;
}

/// Grants or refuses read access to individual series.
pub trait Authorizer: Send + Sync {
    /// True when the caller may read the series identified by
    /// `measurement` and `tags` in `database`.
    fn authorize_series_read(&self, database: &str, measurement: &str, tags: &TagSet) -> bool;
}

/// The union of several shards' indexes over one database, together with
/// the database's series file. Catalog queries are answered against this
/// merged view.
pub struct IndexSet {
    /// Database the indexes belong to.
    pub database: String,
    /// One index per shard, in no particular order.
    pub indexes: Vec<Arc<dyn Index>>,
    /// The database's series catalog.
    pub series_file: Arc<SeriesFile>,
}

impl IndexSet {
    /// Sorted measurement names across all indexes. A measurement is
    /// included when at least one of its series satisfies `expr`
    /// (conservatively, for comparisons undecidable from tags) and, when
    /// an authorizer is given, is readable.
    pub fn measurement_names_by_expr(
        &self,
        auth: Option<&dyn Authorizer>,
        expr: Option<&Expr>,
    ) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for index in &self.indexes {
            for name in index.measurement_names() {
                if expr.is_none() && auth.is_none() {
                    names.push(name);
                    continue;
                }
                if self.measurement_has_matching_series(auth, expr, &name) {
                    names.push(name);
                }
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }

    fn measurement_has_matching_series(
        &self,
        auth: Option<&dyn Authorizer>,
        expr: Option<&Expr>,
        name: &str,
    ) -> bool {
        for index in &self.indexes {
            let ids = index.measurement_series_ids(name);
            for id in ids.iter() {
                let Some((measurement, tags)) = index.series_tags(id) else {
                    continue;
                };
                if let Some(expr) = expr {
                    if expr.matches_tags(&measurement, &tags) == Some(false) {
                        continue;
                    }
                }
                if let Some(auth) = auth {
                    if !auth.authorize_series_read(&self.database, &measurement, &tags) {
                        continue;
                    }
                }
                return true;
            }
        }
        false
    }

    /// Sorted union of a measurement's tag keys across all indexes.
    pub fn measurement_tag_keys(&self, name: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .indexes
            .iter()
            .flat_map(|index| index.tag_keys(name))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// True when at least one series carrying `key` in `name` is readable.
    pub fn tag_key_has_authorized_series(
        &self,
        auth: Option<&dyn Authorizer>,
        name: &str,
        key: &str,
    ) -> bool {
        for index in &self.indexes {
            let ids = index.measurement_series_ids(name);
            for id in ids.iter() {
                let Some((measurement, tags)) = index.series_tags(id) else {
                    continue;
                };
                if tags.get(key).is_none() {
                    continue;
                }
                match auth {
                    None => return true,
                    Some(auth) => {
                        if auth.authorize_series_read(&self.database, &measurement, &tags) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// For each of `keys`, the sorted distinct values appearing on
    /// authorized series of `name` that satisfy `filter`.
    pub fn measurement_tag_key_values_by_expr(
        &self,
        auth: Option<&dyn Authorizer>,
        name: &str,
        keys: &[String],
        filter: Option<&Expr>,
    ) -> Vec<Vec<String>> {
        let mut values: Vec<Vec<String>> = vec![Vec::new(); keys.len()];
        for index in &self.indexes {
            let ids = index.measurement_series_ids_by_expr(name, filter);
            for id in ids.iter() {
                let Some((measurement, tags)) = index.series_tags(id) else {
                    continue;
                };
                if let Some(auth) = auth {
                    if !auth.authorize_series_read(&self.database, &measurement, &tags) {
                        continue;
                    }
                }
                for (i, key) in keys.iter().enumerate() {
                    if let Some(value) = tags.get(key) {
                        values[i].push(value.to_string());
                    }
                }
            }
        }
        for list in &mut values {
            list.sort_unstable();
            list.dedup();
        }
        values
    }

    /// Union of a measurement's series ids across all indexes, restricted
    /// by `expr`.
    pub fn measurement_series_ids_by_expr(&self, name: &str, expr: Option<&Expr>) -> Treemap {
        let mut ids = Treemap::new();
        for index in &self.indexes {
            ids.or_inplace(&index.measurement_series_ids_by_expr(name, expr));
        }
        ids
    }
}
