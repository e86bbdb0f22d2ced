//! The shard store
//!
//! [`Store`] coordinates a time-series database's on-disk data: a catalog
//! of shards grouped by database and retention policy, one series file per
//! database, and the epoch trackers serializing conflicting writes and
//! deletes. Shards are opened in parallel on startup, created and deleted
//! under live traffic, and queried for merged catalog metadata.
//!
//! Locking discipline: the catalog lock is held only for map reads and
//! transitions, never across shard I/O, filesystem operations, or guard
//! waits. Operations snapshot the shards they need under the lock, release
//! it, then work on the snapshot.

mod load;
mod monitor;
mod queries;

use crate::config::StoreConfig;
use crate::engine::{EngineOptions, Shard, ShardBuilder, ShardContext};
use crate::epoch::{EpochTracker, Guard};
use crate::error::{Error, Result};
use crate::expr::{self, Expr};
use crate::limiter::{Fixed, Rate};
use crate::series_file::{SeriesFile, SERIES_FILE_DIRECTORY};
use crate::types::{Point, ShardId, Statistic, MAX_TIME, MIN_TIME};
use croaring::Treemap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-database bookkeeping: how many shards use each index type.
#[derive(Debug, Default)]
struct DatabaseState {
    index_types: HashMap<String, usize>,
}

impl DatabaseState {
    fn add_index_type(&mut self, index_type: &str) {
        *self.index_types.entry(index_type.to_string()).or_default() += 1;
    }

    fn remove_index_type(&mut self, index_type: &str) {
        if let Some(count) = self.index_types.get_mut(index_type) {
            *count -= 1;
            if *count == 0 {
                self.index_types.remove(index_type);
            }
        }
    }

    fn has_multiple_index_types(&self) -> bool {
        self.index_types.len() > 1
    }

    fn index_type_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self
            .index_types
            .iter()
            .map(|(t, &n)| (t.clone(), n))
            .collect();
        counts.sort_unstable();
        counts
    }
}

/// Authoritative in-memory state, guarded by the catalog lock.
struct Catalog {
    shards: HashMap<ShardId, Arc<dyn Shard>>,
    sfiles: HashMap<String, Arc<SeriesFile>>,
    databases: HashMap<String, DatabaseState>,
    /// Shards mid-deletion; their ids cannot be recreated yet.
    pending_shard_deletes: HashSet<ShardId>,
    epochs: HashMap<ShardId, Arc<EpochTracker>>,
    /// Cancelled when the store begins closing.
    closing: CancellationToken,
    engine_options: Option<EngineOptions>,
    opened: bool,
}

impl Catalog {
    fn filter_shards(&self, pred: impl Fn(&dyn Shard) -> bool) -> Vec<Arc<dyn Shard>> {
        self.shards
            .values()
            .filter(|sh| pred(sh.as_ref()))
            .cloned()
            .collect()
    }

    fn epochs_for_shards(
        &self,
        shards: &[Arc<dyn Shard>],
    ) -> HashMap<ShardId, Arc<EpochTracker>> {
        shards
            .iter()
            .filter_map(|sh| {
                self.epochs
                    .get(&sh.id())
                    .map(|e| (sh.id(), Arc::clone(e)))
            })
            .collect()
    }
}

/// Manages shards and series files for all databases under one data root.
pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    builder: Arc<dyn ShardBuilder>,
    state: RwLock<Catalog>,
    /// Serializes series-file creation per store.
    sfile_create: tokio::sync::Mutex<()>,
    monitor: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Store {
    /// Create a closed store rooted at `path`. Call [`Store::open`] before
    /// use.
    pub fn new(
        path: impl Into<PathBuf>,
        config: StoreConfig,
        builder: Arc<dyn ShardBuilder>,
    ) -> Arc<Self> {
        // Operations before the first open observe a closed store.
        let closing = CancellationToken::new();
        closing.cancel();
        Arc::new(Self {
            path: path.into(),
            config,
            builder,
            state: RwLock::new(Catalog {
                shards: HashMap::new(),
                sfiles: HashMap::new(),
                databases: HashMap::new(),
                pending_shard_deletes: HashSet::new(),
                epochs: HashMap::new(),
                closing,
                engine_options: None,
                opened: false,
            }),
            sfile_create: tokio::sync::Mutex::new(()),
            monitor: parking_lot::Mutex::new(None),
        })
    }

    /// The store's root data path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialize the store: create directories, discover and open every
    /// shard in parallel, and start periodic maintenance. Idempotent.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.read();
            if state.opened {
                return Ok(());
            }
        }

        info!(path = %self.path.display(), "using data dir");
        create_dir_all_mode(&self.path, 0o777)?;

        let options = self.build_engine_options();
        let closing = CancellationToken::new();
        {
            let mut state = self.state.write();
            state.shards.clear();
            state.epochs.clear();
            state.databases.clear();
            state.closing = closing.clone();
            state.engine_options = Some(options.clone());
        }

        load::load_shards(self, &options).await?;

        self.state.write().opened = true;

        if !self.config.monitor_disabled {
            let store = Arc::clone(self);
            *self.monitor.lock() = Some(tokio::spawn(async move {
                monitor::run(store, closing).await;
            }));
        }

        Ok(())
    }

    fn build_engine_options(&self) -> EngineOptions {
        let cores = num_cpus::get();
        let compaction_limit = self.config.compaction_limit();
        let throughput = self.config.compact_throughput;
        let burst = self.config.throughput_burst();

        if throughput > 0 {
            info!(
                max_concurrent_compactions = compaction_limit,
                throughput_bytes_per_second = throughput,
                throughput_bytes_per_second_burst = burst,
                "compaction settings"
            );
        } else {
            info!(
                max_concurrent_compactions = compaction_limit,
                throughput_bytes_per_second = "unlimited",
                "compaction settings"
            );
        }

        EngineOptions {
            open_limiter: Fixed::new(cores),
            compaction_limiter: Fixed::new(compaction_limit),
            compaction_throughput: (throughput > 0).then(|| Rate::new(throughput, burst)),
            compactions_disabled: self.config.compactions_disabled,
        }
    }

    /// Close the store and all shards. Afterwards, operations return
    /// [`Error::StoreClosed`] until the store is reopened.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.read();
            if state.opened {
                state.closing.cancel();
            }
        }

        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.await;
        }

        let shards = self.state.read().filter_shards(|_| true);
        walk_shards(shards, |sh| {
            Box::pin(async move { sh.close().await })
        })
        .await?;

        let sfiles: Vec<Arc<SeriesFile>> = {
            let state = self.state.read();
            state.sfiles.values().cloned().collect()
        };
        for sfile in sfiles {
            sfile.close().await?;
        }

        let mut state = self.state.write();
        state.shards.clear();
        state.sfiles.clear();
        state.databases.clear();
        state.pending_shard_deletes.clear();
        state.epochs.clear();
        state.engine_options = None;
        state.opened = false;
        Ok(())
    }

    /// The token cancelled when the store begins closing.
    pub(crate) fn closing_token(&self) -> CancellationToken {
        self.state.read().closing.clone()
    }

    fn engine_options(&self) -> EngineOptions {
        self.state
            .read()
            .engine_options
            .clone()
            .unwrap_or_default()
    }

    /// Return or lazily create the series file for `database`.
    async fn open_series_file(&self, database: &str) -> Result<Arc<SeriesFile>> {
        if let Some(sfile) = self.state.read().sfiles.get(database) {
            return Ok(Arc::clone(sfile));
        }

        let _create = self.sfile_create.lock().await;
        if let Some(sfile) = self.state.read().sfiles.get(database) {
            return Ok(Arc::clone(sfile));
        }

        let sfile = Arc::new(
            SeriesFile::new(self.path.join(database).join(SERIES_FILE_DIRECTORY))
                .with_max_compaction_concurrency(
                    self.config.series_file_max_compaction_concurrency,
                ),
        );
        sfile.open().await?;
        self.state
            .write()
            .sfiles
            .insert(database.to_string(), Arc::clone(&sfile));
        Ok(sfile)
    }

    fn series_file(&self, database: &str) -> Option<Arc<SeriesFile>> {
        self.state.read().sfiles.get(database).cloned()
    }

    /// Look up a shard by id.
    pub fn shard(&self, id: ShardId) -> Option<Arc<dyn Shard>> {
        self.state.read().shards.get(&id).cloned()
    }

    /// Look up several shards by id; missing ids are skipped.
    pub fn shards(&self, ids: &[ShardId]) -> Vec<Arc<dyn Shard>> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.shards.get(id).cloned())
            .collect()
    }

    /// Number of shards under management.
    pub fn shard_n(&self) -> usize {
        self.state.read().shards.len()
    }

    /// Ids of every shard under management, unordered.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.state.read().shards.keys().copied().collect()
    }

    /// Names of every database with at least one shard or series file.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().databases.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Total shard data size in bytes, excluding WALs.
    pub async fn disk_size(&self) -> Result<i64> {
        let shards = self.state.read().filter_shards(|_| true);
        let mut size = 0i64;
        for sh in shards {
            size += sh.disk_size().await?;
        }
        Ok(size)
    }

    /// Approximate in-memory footprint of every shard index.
    pub fn index_bytes(&self) -> usize {
        let shards = self.state.read().filter_shards(|_| true);
        shards.iter().map(|sh| sh.index().bytes()).sum()
    }

    /// Create a shard for `database`/`retention_policy` with the given id.
    /// Succeeds without effect when the shard already exists.
    pub async fn create_shard(
        &self,
        database: &str,
        retention_policy: &str,
        shard_id: ShardId,
        enabled: bool,
    ) -> Result<()> {
        {
            let state = self.state.read();
            if state.closing.is_cancelled() {
                return Err(Error::StoreClosed);
            }
            if state.shards.contains_key(&shard_id) {
                return Ok(());
            }
            if state.pending_shard_deletes.contains(&shard_id) {
                return Err(Error::ShardDeletion(shard_id));
            }
        }

        create_dir_all_mode(&self.path.join(database).join(retention_policy), 0o700)?;
        let wal_path = self
            .config
            .wal_dir
            .join(database)
            .join(retention_policy)
            .join(shard_id.to_string());
        create_dir_all_mode(&wal_path, 0o700)?;

        let sfile = self.open_series_file(database).await?;

        let path = self
            .path
            .join(database)
            .join(retention_policy)
            .join(shard_id.to_string());
        let shard = self.builder.build(ShardContext {
            id: shard_id,
            database: database.to_string(),
            retention_policy: retention_policy.to_string(),
            path,
            wal_path,
            series_file: sfile,
            options: self.engine_options(),
        });
        shard
            .open()
            .await
            .map_err(|e| Error::ShardOpen {
                id: shard_id,
                source: Box::new(e),
            })?;
        shard.set_enabled(enabled);

        enum Commit {
            Done,
            LostRace,
            Refused(Error),
        }

        let commit = {
            let mut state = self.state.write();
            if state.closing.is_cancelled() {
                Commit::Refused(Error::StoreClosed)
            } else if state.shards.contains_key(&shard_id) {
                Commit::LostRace
            } else if state.pending_shard_deletes.contains(&shard_id) {
                Commit::Refused(Error::ShardDeletion(shard_id))
            } else {
                state.shards.insert(shard_id, Arc::clone(&shard));
                state
                    .epochs
                    .insert(shard_id, Arc::new(EpochTracker::new()));
                let db_state = state.databases.entry(database.to_string()).or_default();
                db_state.add_index_type(shard.index_type());
                if db_state.has_multiple_index_types() {
                    warn!(
                        database,
                        index_types = ?db_state.index_type_counts(),
                        "mixed shard index types"
                    );
                }
                Commit::Done
            }
        };

        match commit {
            Commit::Done => Ok(()),
            // Another creator won the race; ours never made the catalog.
            Commit::LostRace => {
                let _ = shard.close().await;
                Ok(())
            }
            Commit::Refused(e) => {
                let _ = shard.close().await;
                Err(e)
            }
        }
    }

    /// Enable or disable reads and writes on a shard.
    pub fn set_shard_enabled(&self, shard_id: ShardId, enabled: bool) -> Result<()> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        sh.set_enabled(enabled);
        Ok(())
    }

    /// Delete every shard in the store.
    pub async fn delete_shards(&self) -> Result<()> {
        for id in self.shard_ids() {
            self.delete_shard(id).await?;
        }
        Ok(())
    }

    /// Remove a shard and its on-disk data. Succeeds without effect when
    /// the id is unknown. Series unique to this shard are removed from the
    /// database's series file.
    pub async fn delete_shard(&self, shard_id: ShardId) -> Result<()> {
        let Some(sh) = self.shard(shard_id) else {
            return Ok(());
        };

        // Transition the catalog first so the shard stops being returned
        // to callers, then do the slow work without the lock.
        let database = sh.database().to_string();
        let other_shards = {
            let mut state = self.state.write();
            if state.pending_shard_deletes.contains(&shard_id) {
                // A concurrent delete got here first; deleting a shard
                // twice is not an error.
                return Ok(());
            }
            state.shards.remove(&shard_id);
            state.epochs.remove(&shard_id);
            state.pending_shard_deletes.insert(shard_id);
            state.filter_shards(|other| other.database() == database)
        };

        let result = self.delete_shard_data(&sh, &database, other_shards).await;

        // Always clear the pending flag and the index-type count, even on
        // error paths, so the id can be recreated.
        let mut state = self.state.write();
        state.pending_shard_deletes.remove(&shard_id);
        if let Some(db_state) = state.databases.get_mut(&database) {
            db_state.remove_index_type(sh.index_type());
        }
        drop(state);

        result
    }

    async fn delete_shard_data(
        &self,
        sh: &Arc<dyn Shard>,
        database: &str,
        other_shards: Vec<Arc<dyn Shard>>,
    ) -> Result<()> {
        // Series present only in this shard are dead once it goes away.
        let unique = Arc::new(parking_lot::Mutex::new(sh.index().series_id_set()));
        {
            let unique = Arc::clone(&unique);
            walk_shards(other_shards, move |other| {
                let unique = Arc::clone(&unique);
                Box::pin(async move {
                    let other_ids = other.index().series_id_set();
                    unique.lock().andnot_inplace(&other_ids);
                    Ok(())
                })
            })
            .await?;
        }

        let unique = Arc::try_unwrap(unique)
            .map(|m| m.into_inner())
            .unwrap_or_else(|arc| arc.lock().clone());
        if unique.cardinality() > 0 {
            if let Some(sfile) = self.series_file(database) {
                for id in unique.iter() {
                    sfile.delete_series_id(id).await?;
                }
            }
        }

        sh.close()
            .await
            .map_err(|e| Error::ShardClose {
                id: sh.id(),
                source: Box::new(e),
            })?;

        remove_dir_ignore_missing(sh.path()).await?;
        remove_dir_ignore_missing(sh.wal_path()).await?;
        Ok(())
    }

    /// Close every shard of a database and remove its data, WAL, and
    /// series file. Succeeds without effect when the database is unknown.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        let shards = {
            let state = self.state.read();
            if !state.databases.contains_key(name) {
                return Ok(());
            }
            state.filter_shards(|sh| sh.database() == name)
        };

        walk_shards(shards.clone(), |sh| {
            Box::pin(async move { sh.close().await })
        })
        .await?;

        let sfile = {
            let mut state = self.state.write();
            state.sfiles.remove(name)
        };
        if let Some(sfile) = sfile {
            sfile.close().await?;
        }

        // Guard against names like "../.." escaping the store root.
        let db_path = normalize(&self.path.join(name));
        if db_path.parent() != Some(normalize(&self.path).as_path()) {
            return Err(Error::PathEscape {
                scope: "database",
                path: db_path,
            });
        }

        remove_dir_ignore_missing(&db_path).await?;
        remove_dir_ignore_missing(&self.config.wal_dir.join(name)).await?;

        let mut state = self.state.write();
        for sh in &shards {
            state.shards.remove(&sh.id());
            state.epochs.remove(&sh.id());
        }
        state.databases.remove(name);
        Ok(())
    }

    /// Close every shard of a retention policy and remove its directories
    /// in the data and WAL roots. Succeeds without effect when the
    /// database is unknown.
    pub async fn delete_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let shards = {
            let state = self.state.read();
            if !state.databases.contains_key(database) {
                return Ok(());
            }
            state.filter_shards(|sh| {
                sh.database() == database && sh.retention_policy() == name
            })
        };

        walk_shards(shards.clone(), |sh| {
            Box::pin(async move { sh.close().await })
        })
        .await?;

        // The retention policy must be exactly two levels below the root.
        let rp_path = normalize(&self.path.join(database).join(name));
        let grandparent = rp_path.parent().and_then(Path::parent);
        if grandparent != Some(normalize(&self.path).as_path()) {
            return Err(Error::PathEscape {
                scope: "retention policy",
                path: rp_path,
            });
        }

        remove_dir_ignore_missing(&rp_path).await?;
        remove_dir_ignore_missing(&self.config.wal_dir.join(database).join(name)).await?;

        let mut state = self.state.write();
        for sh in &shards {
            state.shards.remove(&sh.id());
            if let Some(db_state) = state.databases.get_mut(database) {
                db_state.remove_index_type(sh.index_type());
            }
        }
        Ok(())
    }

    /// Remove a measurement and all associated series from a database.
    pub async fn delete_measurement(&self, database: &str, name: &str) -> Result<()> {
        let (shards, epochs) = {
            let state = self.state.read();
            if state
                .databases
                .get(database)
                .is_some_and(DatabaseState::has_multiple_index_types)
            {
                return Err(Error::MultipleIndexTypes(database.to_string()));
            }
            let shards = state.filter_shards(|sh| sh.database() == database);
            let epochs = state.epochs_for_shards(&shards);
            (shards, epochs)
        };
        let closing = self.closing_token();
        let name = name.to_string();

        // One delete at a time across shards: expanding a measurement into
        // series keys is memory intensive.
        let limit = Fixed::new(1);
        walk_shards(shards, move |sh| {
            let epochs = epochs.clone();
            let closing = closing.clone();
            let limit = limit.clone();
            let name = name.clone();
            Box::pin(async move {
                let Some(tracker) = epochs.get(&sh.id()).cloned() else {
                    // The shard left the catalog after the snapshot.
                    return Ok(());
                };
                let _slot = limit.acquire().await;

                // Install our guard and wait out earlier writes; later
                // writes that could conflict wait for us.
                let guard = Guard::new(MIN_TIME, MAX_TIME, vec![name.clone()], None);
                let waiter = tracker.wait_delete(guard);
                waiter.wait(&closing).await?;
                let result = sh.delete_measurement(&name).await;
                waiter.done();
                result
            })
        })
        .await
    }

    /// Remove series data in `database`, restricted to `names` (empty =
    /// all measurements) and an optional condition whose `time` bounds
    /// scope the delete.
    pub async fn delete_series(
        &self,
        database: &str,
        names: &[String],
        condition: Option<&Expr>,
    ) -> Result<()> {
        let (condition, range) = expr::condition_time_range(condition);

        let (sfile, shards, epochs) = {
            let state = self.state.read();
            if state
                .databases
                .get(database)
                .is_some_and(DatabaseState::has_multiple_index_types)
            {
                return Err(Error::MultipleIndexTypes(database.to_string()));
            }
            let Some(sfile) = state.sfiles.get(database).cloned() else {
                // Nothing was ever written to this database.
                return Ok(());
            };
            let shards = state.filter_shards(|sh| sh.database() == database);
            let epochs = state.epochs_for_shards(&shards);
            (sfile, shards, epochs)
        };
        let closing = self.closing_token();
        let names: Vec<String> = names.to_vec();
        let condition = Arc::new(condition);

        let limit = Fixed::new(1);
        walk_shards(shards, move |sh| {
            let epochs = epochs.clone();
            let closing = closing.clone();
            let limit = limit.clone();
            let names = names.clone();
            let condition = Arc::clone(&condition);
            let sfile = Arc::clone(&sfile);
            Box::pin(async move {
                let Some(tracker) = epochs.get(&sh.id()).cloned() else {
                    return Ok(());
                };

                // Delete from every measurement when none were named.
                let mut names = if names.is_empty() {
                    sh.index().measurement_names()
                } else {
                    names
                };
                names.sort_unstable();

                let _slot = limit.acquire().await;

                let guard = Guard::new(
                    range.min,
                    range.max,
                    names.clone(),
                    condition.as_ref().clone(),
                );
                let waiter = tracker.wait_delete(guard);
                waiter.wait(&closing).await?;

                let result = async {
                    let index_set = crate::engine::IndexSet {
                        database: sh.database().to_string(),
                        indexes: vec![sh.index()],
                        series_file: sfile,
                    };
                    for name in &names {
                        let ids = index_set
                            .measurement_series_ids_by_expr(name, condition.as_ref().as_ref());
                        if ids.is_empty() {
                            continue;
                        }
                        let ids: Vec<u64> = ids.iter().collect();
                        sh.delete_series_range(&ids, range.min, range.max).await?;
                    }
                    Ok(())
                }
                .await;
                waiter.done();
                result
            })
        })
        .await
    }

    /// Write a batch of points to the shard with the given id.
    pub async fn write_to_shard(&self, shard_id: ShardId, points: &[Point]) -> Result<()> {
        let (sh, epoch, closing) = {
            let state = self.state.read();
            if state.closing.is_cancelled() {
                return Err(Error::StoreClosed);
            }
            let sh = state
                .shards
                .get(&shard_id)
                .cloned()
                .ok_or(Error::ShardNotFound(shard_id))?;
            let epoch = state
                .epochs
                .get(&shard_id)
                .cloned()
                .ok_or(Error::ShardNotFound(shard_id))?;
            (sh, epoch, state.closing.clone())
        };

        let (guards, permit) = epoch.start_write();
        for guard in &guards {
            if guard.matches(points) {
                guard.wait(&closing).await?;
            }
        }

        // The monitor may have paused compactions on a cold shard; writing
        // warms it back up.
        if sh.is_idle() {
            sh.set_compactions_enabled(true);
        }

        let result = sh.write_points(points).await;
        drop(permit);
        result
    }

    /// A snapshot of the shard's contents; the caller removes the returned
    /// path when done with it.
    pub async fn create_shard_snapshot(
        &self,
        shard_id: ShardId,
        skip_cache_ok: bool,
    ) -> Result<PathBuf> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        sh.create_snapshot(skip_cache_ok).await
    }

    /// A digest of the shard's contents.
    pub async fn shard_digest(&self, shard_id: ShardId) -> Result<Vec<u8>> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        sh.digest().await
    }

    /// Stream shard data changed since `since` to `w`.
    pub async fn backup_shard(
        &self,
        shard_id: ShardId,
        since: i64,
        w: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        let path = self.shard_relative_path(shard_id)?;
        sh.backup(w, &path, since).await
    }

    /// Stream shard data inside `[start, end]` to `w`.
    pub async fn export_shard(
        &self,
        shard_id: ShardId,
        start: i64,
        end: i64,
        w: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        let path = self.shard_relative_path(shard_id)?;
        sh.export(w, &path, start, end).await
    }

    /// Restore a backup stream into a shard, overwriting its contents.
    pub async fn restore_shard(
        &self,
        shard_id: ShardId,
        r: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        let path = self.shard_relative_path(shard_id)?;
        sh.restore(r, &path).await
    }

    /// Merge a backup stream into a shard, keeping existing data.
    pub async fn import_shard(
        &self,
        shard_id: ShardId,
        r: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        let path = self.shard_relative_path(shard_id)?;
        sh.import(r, &path).await
    }

    /// The shard's path relative to the store root, i.e.
    /// `<database>/<rp>/<id>`.
    pub fn shard_relative_path(&self, shard_id: ShardId) -> Result<String> {
        let sh = self.shard(shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        relative_path(&self.path, sh.path())
    }

    /// Per-database and per-shard monitoring statistics.
    pub async fn statistics(&self, tags: &BTreeMap<String, String>) -> Vec<Statistic> {
        let shards = self.state.read().filter_shards(|_| true);
        let never = CancellationToken::new();

        let mut statistics = Vec::new();
        for database in self.databases() {
            let sc = match self.series_cardinality(&never, &database).await {
                Ok(sc) => sc,
                Err(e) => {
                    info!(database = %database, error = %e, "cannot retrieve series cardinality");
                    continue;
                }
            };
            let mc = match self.measurements_cardinality(&never, &database).await {
                Ok(mc) => mc,
                Err(e) => {
                    info!(database = %database, error = %e, "cannot retrieve measurement cardinality");
                    continue;
                }
            };

            let mut stat_tags = tags.clone();
            stat_tags.insert("database".to_string(), database.clone());
            let mut values = BTreeMap::new();
            values.insert("numSeries".to_string(), sc);
            values.insert("numMeasurements".to_string(), mc);
            statistics.push(Statistic {
                name: "database".to_string(),
                tags: stat_tags,
                values,
            });
        }

        for sh in shards {
            statistics.extend(sh.statistics(tags));
        }
        statistics
    }

    pub(crate) fn shards_for_database(&self, database: &str) -> Vec<Arc<dyn Shard>> {
        self.state
            .read()
            .filter_shards(|sh| sh.database() == database)
    }

    pub(crate) fn insert_loaded_shard(&self, shard: Arc<dyn Shard>) {
        let mut state = self.state.write();
        let database = shard.database().to_string();
        state
            .epochs
            .insert(shard.id(), Arc::new(EpochTracker::new()));
        state
            .databases
            .entry(database)
            .or_default()
            .add_index_type(shard.index_type());
        state.shards.insert(shard.id(), shard);
    }

    pub(crate) fn warn_mixed_index_types(&self) {
        let state = self.state.read();
        for (database, db_state) in &state.databases {
            if db_state.has_multiple_index_types() {
                warn!(
                    database = %database,
                    index_types = ?db_state.index_type_counts(),
                    "mixed shard index types"
                );
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("shards", &state.shards.len())
            .field("databases", &state.databases.len())
            .field("opened", &state.opened)
            .finish()
    }
}

/// Apply `f` to every shard in parallel, bounded by the core count. The
/// first error is returned after all shards complete; siblings are never
/// cancelled on failure so best-effort cleanup still happens.
pub(crate) async fn walk_shards<F>(shards: Vec<Arc<dyn Shard>>, f: F) -> Result<()>
where
    F: Fn(Arc<dyn Shard>) -> BoxFuture<'static, Result<()>>,
{
    let limit = Fixed::new(num_cpus::get());
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for sh in shards {
        let id = sh.id();
        let fut = f(Arc::clone(&sh));
        let limit = limit.clone();
        tasks.spawn(async move {
            let _slot = limit.acquire().await;
            fut.await.map_err(|e| Error::for_shard(id, e))
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                error!(error = %e, "shard task panicked");
                if first_err.is_none() {
                    first_err = Some(Error::Engine(format!("shard task failed: {e}")));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Union every shard's series-id bitset; used for exact cardinality.
pub(crate) async fn union_series_ids(
    shards: Vec<Arc<dyn Shard>>,
    cancel: &CancellationToken,
) -> Result<Treemap> {
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    let sets = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let sets = Arc::clone(&sets);
        let cancel = cancel.clone();
        walk_shards(shards, move |sh| {
            let sets = Arc::clone(&sets);
            let cancel = cancel.clone();
            Box::pin(async move {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                let ids = sh.index().series_id_set();
                sets.lock().push(ids);
                Ok(())
            })
        })
        .await?;
    }

    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    let mut union = Treemap::new();
    for set in sets.lock().iter() {
        union.or_inplace(set);
    }
    Ok(union)
}

/// Create a directory tree with an explicit mode on Unix.
fn create_dir_all_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        std::fs::create_dir_all(path)
    }
}

async fn remove_dir_ignore_missing(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem. Used for the path-escape checks before recursive removal.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// The shard path relative to the store root.
fn relative_path(store_path: &Path, shard_path: &Path) -> Result<String> {
    shard_path
        .strip_prefix(store_path)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| Error::PathEscape {
            scope: "shard",
            path: shard_path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_state_counts_index_types() {
        let mut state = DatabaseState::default();
        state.add_index_type("inmem");
        state.add_index_type("inmem");
        assert!(!state.has_multiple_index_types());
        state.add_index_type("tsi1");
        assert!(state.has_multiple_index_types());
        state.remove_index_type("tsi1");
        assert!(!state.has_multiple_index_types());
        state.remove_index_type("inmem");
        state.remove_index_type("inmem");
        assert!(state.index_types.is_empty());
    }

    #[test]
    fn normalize_resolves_traversal() {
        assert_eq!(
            normalize(Path::new("/data/db0/../../etc")),
            PathBuf::from("/etc")
        );
        assert_eq!(normalize(Path::new("/data/./db0")), PathBuf::from("/data/db0"));
    }

    #[test]
    fn relative_path_requires_prefix() {
        assert_eq!(
            relative_path(Path::new("/data"), Path::new("/data/db0/rp0/1")).unwrap(),
            "db0/rp0/1"
        );
        assert!(relative_path(Path::new("/data"), Path::new("/other/db0")).is_err());
    }
}
