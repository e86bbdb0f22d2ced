//! Per-database series catalog
//!
//! Every database owns one series file at `<root>/<db>/_series/`, shared by
//! all of its shards. It allocates monotonically increasing series ids and
//! records deletions, persisting both as an append-only log that is
//! replayed on open. The log is compacted in place once tombstones
//! outnumber live entries.

use crate::error::{Error, Result};
use crate::types::SeriesId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Name of the series-file directory inside a database directory.
pub const SERIES_FILE_DIRECTORY: &str = "_series";

const LOG_FILE: &str = "series.log";

#[derive(Default)]
struct SeriesState {
    ids: HashMap<String, SeriesId>,
    keys: HashMap<SeriesId, String>,
    tombstones: HashSet<SeriesId>,
    next_id: SeriesId,
}

/// The series catalog for one database.
pub struct SeriesFile {
    path: PathBuf,
    state: RwLock<SeriesState>,
    log: tokio::sync::Mutex<Option<File>>,
    max_compaction_concurrency: usize,
}

impl SeriesFile {
    /// Create a closed series file rooted at `path` (the `_series`
    /// directory itself).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(SeriesState::default()),
            log: tokio::sync::Mutex::new(None),
            max_compaction_concurrency: 1,
        }
    }

    /// Cap the number of concurrent snapshot compactions. Takes effect on
    /// the next open.
    pub fn with_max_compaction_concurrency(mut self, n: usize) -> Self {
        self.max_compaction_concurrency = n.max(1);
        self
    }

    /// Directory this series file lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed and replay the log.
    pub async fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.path).await?;
        let log_path = self.path.join(LOG_FILE);

        let mut state = SeriesState::default();
        match fs::read_to_string(&log_path).await {
            Ok(contents) => {
                for (lineno, line) in contents.lines().enumerate() {
                    Self::replay_line(&mut state, line).map_err(|reason| Error::SeriesFile {
                        database: self.database_name(),
                        reason: format!("log line {}: {reason}", lineno + 1),
                    })?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        *self.state.write() = state;
        *self.log.lock().await = Some(file);
        Ok(())
    }

    fn replay_line(state: &mut SeriesState, line: &str) -> std::result::Result<(), String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix('+') {
            let rest = rest.trim_start();
            let (id, key) = rest
                .split_once(' ')
                .ok_or_else(|| format!("malformed create record {line:?}"))?;
            let id: SeriesId = id.parse().map_err(|_| format!("bad series id {id:?}"))?;
            state.ids.insert(key.to_string(), id);
            state.keys.insert(id, key.to_string());
            state.tombstones.remove(&id);
            state.next_id = state.next_id.max(id + 1);
            Ok(())
        } else if let Some(rest) = line.strip_prefix('-') {
            let rest = rest.trim_start();
            let id: SeriesId = rest.parse().map_err(|_| format!("bad series id {rest:?}"))?;
            if let Some(key) = state.keys.remove(&id) {
                state.ids.remove(&key);
            }
            state.tombstones.insert(id);
            Ok(())
        } else {
            Err(format!("unknown record {line:?}"))
        }
    }

    /// Flush and drop the log handle.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.log.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Return the id for `key`, allocating and persisting one if absent.
    /// Deleted ids are never reused.
    pub async fn create_series_id(&self, key: &str) -> Result<SeriesId> {
        if let Some(id) = self.series_id(key) {
            return Ok(id);
        }

        let mut log = self.log.lock().await;
        let file = log.as_mut().ok_or_else(|| Error::SeriesFile {
            database: self.database_name(),
            reason: "not open".to_string(),
        })?;

        // Re-check under the writer lock; another caller may have won.
        if let Some(id) = self.series_id(key) {
            return Ok(id);
        }

        let id = {
            let mut state = self.state.write();
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        file.write_all(format!("+ {id} {key}\n").as_bytes()).await?;

        let mut state = self.state.write();
        state.ids.insert(key.to_string(), id);
        state.keys.insert(id, key.to_string());
        Ok(id)
    }

    /// Remove a series id from the catalog, persisting a tombstone.
    pub async fn delete_series_id(&self, id: SeriesId) -> Result<()> {
        let mut log = self.log.lock().await;
        let file = log.as_mut().ok_or_else(|| Error::SeriesFile {
            database: self.database_name(),
            reason: "not open".to_string(),
        })?;
        file.write_all(format!("- {id}\n").as_bytes()).await?;

        let compact = {
            let mut state = self.state.write();
            if let Some(key) = state.keys.remove(&id) {
                state.ids.remove(&key);
            }
            state.tombstones.insert(id);
            state.tombstones.len() > state.keys.len().max(1)
        };
        drop(log);

        if compact {
            self.compact().await?;
        }
        Ok(())
    }

    /// Rewrite the log with only live entries.
    async fn compact(&self) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.is_none() {
            return Ok(());
        }

        let snapshot: Vec<(SeriesId, String)> = {
            let mut state = self.state.write();
            state.tombstones.clear();
            let mut entries: Vec<_> = state
                .keys
                .iter()
                .map(|(&id, key)| (id, key.clone()))
                .collect();
            entries.sort_unstable_by_key(|(id, _)| *id);
            entries
        };

        let tmp_path = self.path.join(format!("{LOG_FILE}.tmp"));
        let mut tmp = File::create(&tmp_path).await?;
        for (id, key) in &snapshot {
            tmp.write_all(format!("+ {id} {key}\n").as_bytes()).await?;
        }
        tmp.flush().await?;
        drop(tmp);

        fs::rename(&tmp_path, self.path.join(LOG_FILE)).await?;
        *log = Some(
            OpenOptions::new()
                .append(true)
                .open(self.path.join(LOG_FILE))
                .await?,
        );
        Ok(())
    }

    /// Look up the id for a series key.
    pub fn series_id(&self, key: &str) -> Option<SeriesId> {
        self.state.read().ids.get(key).copied()
    }

    /// Look up the key for a series id.
    pub fn series_key(&self, id: SeriesId) -> Option<String> {
        self.state.read().keys.get(&id).cloned()
    }

    /// True when `id` has been deleted.
    pub fn is_deleted(&self, id: SeriesId) -> bool {
        self.state.read().tombstones.contains(&id)
    }

    /// Number of live series.
    pub fn series_count(&self) -> u64 {
        self.state.read().keys.len() as u64
    }

    fn database_name(&self) -> String {
        // <root>/<db>/_series -> <db>
        self.path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for SeriesFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesFile")
            .field("path", &self.path)
            .field("series", &self.series_count())
            .finish()
    }
}
