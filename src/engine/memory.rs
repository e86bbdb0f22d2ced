//! In-memory reference engine
//!
//! [`MemShard`] is a complete, volatile implementation of the [`Shard`]
//! trait used for tests, prototyping, and as the reference for engine
//! semantics. Point data lives in memory only; backup and restore streams
//! use a plain line format. Not suitable for production storage.

use super::{EngineOptions, Index, Shard, ShardBuilder, ShardContext};
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::series_file::SeriesFile;
use crate::sketch::Sketch;
use crate::types::{
    parse_series_key, series_key, Point, SeriesId, ShardId, Statistic, TagSet, MAX_TIME, MIN_TIME,
};
use async_trait::async_trait;
use croaring::Treemap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Builds [`MemShard`]s. The index type tag is configurable so tests can
/// simulate databases with mixed index implementations, and handles to
/// every built shard are retained for inspection.
pub struct MemShardBuilder {
    index_type_for: Box<dyn Fn(ShardId) -> String + Send + Sync>,
    built: RwLock<Vec<Arc<MemShard>>>,
}

impl MemShardBuilder {
    /// Builder tagging every shard with the default `"inmem"` index type.
    pub fn new() -> Self {
        Self::with_index_type(|_| "inmem".to_string())
    }

    /// Builder deriving the index type tag from the shard id.
    pub fn with_index_type(f: impl Fn(ShardId) -> String + Send + Sync + 'static) -> Self {
        Self {
            index_type_for: Box::new(f),
            built: RwLock::new(Vec::new()),
        }
    }

    /// Handles to every shard this builder has constructed, in build
    /// order.
    pub fn built_shards(&self) -> Vec<Arc<MemShard>> {
        self.built.read().clone()
    }
}

impl Default for MemShardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardBuilder for MemShardBuilder {
    fn build(&self, ctx: ShardContext) -> Arc<dyn Shard> {
        let index_type = (self.index_type_for)(ctx.id);
        let shard = Arc::new(MemShard::new(ctx, index_type));
        self.built.write().push(Arc::clone(&shard));
        shard
    }
}

struct MeasurementEntry {
    series: Treemap,
    /// tag key -> tag value -> series ids
    tags: BTreeMap<String, BTreeMap<String, Treemap>>,
}

impl Default for MeasurementEntry {
    fn default() -> Self {
        Self {
            series: Treemap::new(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct MemIndexState {
    series: HashMap<SeriesId, (String, TagSet)>,
    measurements: BTreeMap<String, MeasurementEntry>,
    series_sketch: Sketch,
    series_tombstones: Sketch,
    measurement_sketch: Sketch,
    measurement_tombstones: Sketch,
}

/// In-memory tag index over one shard's series.
pub struct MemIndex {
    state: RwLock<MemIndexState>,
}

impl MemIndex {
    fn new() -> Self {
        Self {
            state: RwLock::new(MemIndexState::default()),
        }
    }

    fn add_series(&self, id: SeriesId, measurement: &str, tags: &TagSet) {
        let mut state = self.state.write();
        if state.series.contains_key(&id) {
            return;
        }
        state.series.insert(id, (measurement.to_string(), tags.clone()));
        state
            .series_sketch
            .insert(series_key(measurement, tags).as_bytes());
        if !state.measurements.contains_key(measurement) {
            state.measurement_sketch.insert(measurement.as_bytes());
        }
        let entry = state.measurements.entry(measurement.to_string()).or_default();
        entry.series.add(id);
        for (k, v) in tags.iter() {
            entry
                .tags
                .entry(k.to_string())
                .or_default()
                .entry(v.to_string())
                .or_insert_with(Treemap::new)
                .add(id);
        }
    }

    fn drop_series(&self, id: SeriesId) {
        let mut state = self.state.write();
        let Some((measurement, tags)) = state.series.remove(&id) else {
            return;
        };
        state
            .series_tombstones
            .insert(series_key(&measurement, &tags).as_bytes());

        let remove_measurement = if let Some(entry) = state.measurements.get_mut(&measurement) {
            entry.series.remove(id);
            for (k, v) in tags.iter() {
                let mut remove_key = false;
                if let Some(values) = entry.tags.get_mut(k) {
                    if let Some(ids) = values.get_mut(v) {
                        ids.remove(id);
                        if ids.is_empty() {
                            values.remove(v);
                        }
                    }
                    remove_key = values.is_empty();
                }
                if remove_key {
                    entry.tags.remove(k);
                }
            }
            entry.series.is_empty()
        } else {
            false
        };

        if remove_measurement {
            state.measurements.remove(&measurement);
            state.measurement_tombstones.insert(measurement.as_bytes());
        }
    }

    fn drop_measurement(&self, name: &str) -> Vec<SeriesId> {
        let ids: Vec<SeriesId> = {
            let state = self.state.read();
            match state.measurements.get(name) {
                Some(entry) => entry.series.iter().collect(),
                None => return Vec::new(),
            }
        };
        for &id in &ids {
            self.drop_series(id);
        }
        ids
    }

    fn sketches(&self) -> ((Sketch, Sketch), (Sketch, Sketch)) {
        let state = self.state.read();
        (
            (state.series_sketch.clone(), state.series_tombstones.clone()),
            (
                state.measurement_sketch.clone(),
                state.measurement_tombstones.clone(),
            ),
        )
    }
}

impl Index for MemIndex {
    fn series_id_set(&self) -> Treemap {
        let state = self.state.read();
        let mut ids = Treemap::new();
        for &id in state.series.keys() {
            ids.add(id);
        }
        ids
    }

    fn measurement_names(&self) -> Vec<String> {
        self.state.read().measurements.keys().cloned().collect()
    }

    fn measurement_series_ids(&self, name: &str) -> Treemap {
        self.state
            .read()
            .measurements
            .get(name)
            .map(|entry| entry.series.clone())
            .unwrap_or_else(Treemap::new)
    }

    fn measurement_series_ids_by_expr(&self, name: &str, expr: Option<&Expr>) -> Treemap {
        let ids = self.measurement_series_ids(name);
        let Some(expr) = expr else {
            return ids;
        };
        let state = self.state.read();
        let mut out = Treemap::new();
        for id in ids.iter() {
            let keep = match state.series.get(&id) {
                // Undecidable comparisons keep the series.
                Some((measurement, tags)) => expr.matches_tags(measurement, tags) != Some(false),
                None => false,
            };
            if keep {
                out.add(id);
            }
        }
        out
    }

    fn tag_keys(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .measurements
            .get(name)
            .map(|entry| entry.tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn tag_values(&self, name: &str, key: &str) -> Vec<String> {
        self.state
            .read()
            .measurements
            .get(name)
            .and_then(|entry| entry.tags.get(key))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn series_tags(&self, id: SeriesId) -> Option<(String, TagSet)> {
        self.state.read().series.get(&id).cloned()
    }

    fn bytes(&self) -> usize {
        let state = self.state.read();
        state
            .series
            .values()
            .map(|(m, tags)| m.len() + tags.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>())
            .sum::<usize>()
            + state.measurements.len() * std::mem::size_of::<MeasurementEntry>()
    }
}

struct MemShardState {
    open: bool,
    enabled: bool,
    compactions_enabled: bool,
    /// Points written since the last free; nonzero means the shard is warm.
    hot_points: u64,
    points: HashMap<SeriesId, Vec<(i64, f64)>>,
    write_count: u64,
}

/// Volatile shard engine backed by in-memory maps.
pub struct MemShard {
    id: ShardId,
    database: String,
    retention_policy: String,
    path: PathBuf,
    wal_path: PathBuf,
    series_file: Arc<SeriesFile>,
    #[allow(dead_code)]
    options: EngineOptions,
    index_type: String,
    index: Arc<MemIndex>,
    state: RwLock<MemShardState>,
}

impl MemShard {
    /// Create a closed shard from its build context.
    pub fn new(ctx: ShardContext, index_type: String) -> Self {
        Self {
            id: ctx.id,
            database: ctx.database,
            retention_policy: ctx.retention_policy,
            path: ctx.path,
            wal_path: ctx.wal_path,
            series_file: ctx.series_file,
            options: ctx.options,
            index_type,
            index: Arc::new(MemIndex::new()),
            state: RwLock::new(MemShardState {
                open: false,
                enabled: false,
                compactions_enabled: true,
                hot_points: 0,
                points: HashMap::new(),
                write_count: 0,
            }),
        }
    }

    /// Points stored for a series, sorted by timestamp.
    pub fn series_points(&self, id: SeriesId) -> Vec<(i64, f64)> {
        let mut points = self
            .state
            .read()
            .points
            .get(&id)
            .cloned()
            .unwrap_or_default();
        points.sort_unstable_by_key(|&(ts, _)| ts);
        points
    }

    /// True when background compactions are currently allowed.
    pub fn compactions_enabled(&self) -> bool {
        self.state.read().compactions_enabled
    }

    fn ensure_writable(&self) -> Result<()> {
        let state = self.state.read();
        if !state.open {
            return Err(Error::Engine(format!("shard {} is not open", self.id)));
        }
        if !state.enabled {
            return Err(Error::Engine(format!("shard {} is disabled", self.id)));
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
        min: i64,
        max: i64,
    ) -> Result<()> {
        let mut lines = String::new();
        {
            let state = self.state.read();
            let mut ids: Vec<&SeriesId> = state.points.keys().collect();
            ids.sort_unstable();
            for id in ids {
                let Some(key) = self.series_file.series_key(*id) else {
                    continue;
                };
                for &(ts, value) in &state.points[id] {
                    if ts >= min && ts <= max {
                        lines.push_str(&format!("{key}\t{ts}\t{value}\n"));
                    }
                }
            }
        }
        w.write_all(lines.as_bytes()).await?;
        w.flush().await?;
        Ok(())
    }

    async fn read_stream(
        &self,
        r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Vec<Point>> {
        let mut buf = String::new();
        r.read_to_string(&mut buf).await?;
        let mut points = Vec::new();
        for line in buf.lines() {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(key), Some(ts), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::Engine(format!("malformed backup record {line:?}")));
            };
            let ts: i64 = ts
                .parse()
                .map_err(|_| Error::Engine(format!("bad timestamp {ts:?}")))?;
            let value: f64 = value
                .parse()
                .map_err(|_| Error::Engine(format!("bad value {value:?}")))?;
            let (measurement, tags) = parse_series_key(key);
            points.push(Point {
                measurement,
                tags,
                timestamp: ts,
                value,
            });
        }
        Ok(points)
    }

    async fn ingest(&self, points: &[Point]) -> Result<()> {
        for point in points {
            let key = point.series_key();
            let id = self.series_file.create_series_id(&key).await?;
            self.index.add_series(id, &point.measurement, &point.tags);
            let mut state = self.state.write();
            state
                .points
                .entry(id)
                .or_default()
                .push((point.timestamp, point.value));
            state.hot_points += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Shard for MemShard {
    fn id(&self) -> ShardId {
        self.id
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn retention_policy(&self) -> &str {
        &self.retention_policy
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    fn index_type(&self) -> &str {
        &self.index_type
    }

    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        tokio::fs::create_dir_all(&self.wal_path).await?;
        let mut state = self.state.write();
        state.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.open = false;
        state.enabled = false;
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    fn set_compactions_enabled(&self, enabled: bool) {
        self.state.write().compactions_enabled = enabled;
    }

    fn is_idle(&self) -> bool {
        self.state.read().hot_points == 0
    }

    async fn free(&self) -> Result<()> {
        self.state.write().hot_points = 0;
        Ok(())
    }

    async fn write_points(&self, points: &[Point]) -> Result<()> {
        self.ensure_writable()?;
        self.ingest(points).await?;
        self.state.write().write_count += 1;
        Ok(())
    }

    async fn delete_measurement(&self, name: &str) -> Result<()> {
        let ids = self.index.drop_measurement(name);
        let mut state = self.state.write();
        for id in ids {
            state.points.remove(&id);
        }
        Ok(())
    }

    async fn delete_series_range(&self, ids: &[SeriesId], min: i64, max: i64) -> Result<()> {
        let full_range = min <= MIN_TIME && max >= MAX_TIME;
        for &id in ids {
            if full_range {
                self.index.drop_series(id);
                self.state.write().points.remove(&id);
            } else {
                let mut state = self.state.write();
                if let Some(points) = state.points.get_mut(&id) {
                    points.retain(|&(ts, _)| ts < min || ts > max);
                }
            }
        }
        Ok(())
    }

    fn index(&self) -> Arc<dyn Index> {
        Arc::clone(&self.index) as Arc<dyn Index>
    }

    fn series_file(&self) -> Arc<SeriesFile> {
        Arc::clone(&self.series_file)
    }

    fn series_n(&self) -> i64 {
        self.index.state.read().series.len() as i64
    }

    async fn disk_size(&self) -> Result<i64> {
        let state = self.state.read();
        let points: usize = state.points.values().map(Vec::len).sum();
        Ok((points * std::mem::size_of::<(i64, f64)>()) as i64)
    }

    fn statistics(&self, tags: &BTreeMap<String, String>) -> Vec<Statistic> {
        let state = self.state.read();
        let mut stat_tags = tags.clone();
        stat_tags.insert("database".to_string(), self.database.clone());
        stat_tags.insert("retention_policy".to_string(), self.retention_policy.clone());
        stat_tags.insert("id".to_string(), self.id.to_string());

        let mut values = BTreeMap::new();
        values.insert("seriesN".to_string(), self.index.state.read().series.len() as i64);
        values.insert("writeReq".to_string(), state.write_count as i64);
        values.insert(
            "pointsN".to_string(),
            state.points.values().map(Vec::len).sum::<usize>() as i64,
        );

        vec![Statistic {
            name: "shard".to_string(),
            tags: stat_tags,
            values,
        }]
    }

    fn series_sketches(&self) -> Result<(Sketch, Sketch)> {
        Ok(self.index.sketches().0)
    }

    fn measurements_sketches(&self) -> Result<(Sketch, Sketch)> {
        Ok(self.index.sketches().1)
    }

    async fn create_snapshot(&self, _skip_cache_ok: bool) -> Result<PathBuf> {
        let snapshot_dir = self.path.join(".snapshot");
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        let snapshot_path = snapshot_dir.join(format!("{}.snap", self.id));
        let mut file = tokio::fs::File::create(&snapshot_path).await?;
        self.write_stream(&mut file, MIN_TIME, MAX_TIME).await?;
        Ok(snapshot_path)
    }

    async fn backup(
        &self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
        _path: &str,
        since: i64,
    ) -> Result<()> {
        self.write_stream(w, since, MAX_TIME).await
    }

    async fn export(
        &self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
        _path: &str,
        start: i64,
        end: i64,
    ) -> Result<()> {
        self.write_stream(w, start, end).await
    }

    async fn restore(&self, r: &mut (dyn AsyncRead + Send + Unpin), _path: &str) -> Result<()> {
        let points = self.read_stream(r).await?;
        self.state.write().points.clear();
        *self.index.state.write() = MemIndexState::default();
        self.ingest(&points).await
    }

    async fn import(&self, r: &mut (dyn AsyncRead + Send + Unpin), _path: &str) -> Result<()> {
        let points = self.read_stream(r).await?;
        self.ingest(&points).await
    }

    async fn digest(&self) -> Result<Vec<u8>> {
        use std::hash::{Hash, Hasher};
        // Keyed by series key so digests compare across series files.
        let state = self.state.read();
        let mut entries: Vec<(String, Vec<(i64, u64)>)> = state
            .points
            .iter()
            .filter_map(|(&id, points)| {
                let key = self.series_file.series_key(id)?;
                let mut points: Vec<(i64, u64)> =
                    points.iter().map(|&(ts, v)| (ts, v.to_bits())).collect();
                points.sort_unstable();
                Some((key, points))
            })
            .collect();
        entries.sort_unstable();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        entries.hash(&mut hasher);
        Ok(hasher.finish().to_be_bytes().to_vec())
    }
}
