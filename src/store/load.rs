//! Parallel shard discovery and open
//!
//! Walks `<root>/<db>/<rp>/<shard_id>` at startup and opens every shard
//! concurrently, bounded by the per-core open limiter. Series files are
//! opened per database before its shards; failures there abort the load.
//! A shard that fails to open contributes the load's returned error but
//! does not stop the remaining shards from loading.

use super::Store;
use crate::engine::{EngineOptions, Shard, ShardContext};
use crate::error::{Error, Result};
use crate::series_file::SERIES_FILE_DIRECTORY;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub(super) async fn load_shards(store: &Arc<Store>, options: &EngineOptions) -> Result<()> {
    let mut tasks: JoinSet<Result<Option<Arc<dyn Shard>>>> = JoinSet::new();

    let mut db_entries = tokio::fs::read_dir(&store.path).await?;
    while let Some(db_entry) = db_entries.next_entry().await? {
        let db_name = db_entry.file_name().to_string_lossy().into_owned();
        if !db_entry.file_type().await?.is_dir() {
            info!(name = %db_name, reason = "not a directory", "skipping database dir");
            continue;
        }
        if let Some(filter) = &store.config.database_filter {
            if !filter(&db_name) {
                info!(db = %db_name, reason = "failed database filter", "skipping database dir");
                continue;
            }
        }

        // The series file must be up before any shard of the database.
        let sfile = store.open_series_file(&db_name).await?;

        let mut rp_entries = tokio::fs::read_dir(db_entry.path()).await?;
        while let Some(rp_entry) = rp_entries.next_entry().await? {
            let rp_name = rp_entry.file_name().to_string_lossy().into_owned();
            if !rp_entry.file_type().await?.is_dir() {
                info!(name = %rp_name, reason = "not a directory", "skipping retention policy dir");
                continue;
            }
            if rp_name == SERIES_FILE_DIRECTORY {
                continue;
            }
            if let Some(filter) = &store.config.retention_policy_filter {
                if !filter(&db_name, &rp_name) {
                    info!(
                        rp = %rp_name,
                        reason = "failed retention policy filter",
                        "skipping retention policy dir"
                    );
                    continue;
                }
            }

            let mut shard_entries = tokio::fs::read_dir(rp_entry.path()).await?;
            while let Some(shard_entry) = shard_entries.next_entry().await? {
                let shard_name = shard_entry.file_name().to_string_lossy().into_owned();
                if shard_name == SERIES_FILE_DIRECTORY {
                    warn!(
                        path = %rp_entry.path().display(),
                        "skipping series file in retention policy dir"
                    );
                    continue;
                }

                let store = Arc::clone(store);
                let options = options.clone();
                let sfile = Arc::clone(&sfile);
                let db_name = db_name.clone();
                let rp_name = rp_name.clone();
                tasks.spawn(async move {
                    let _permit = options.open_limiter.acquire().await;
                    let start = Instant::now();
                    let path = store.path.join(&db_name).join(&rp_name).join(&shard_name);

                    // Shard directory names are numeric shard ids.
                    let shard_id: u64 = match shard_name.parse() {
                        Ok(id) => id,
                        Err(_) => {
                            warn!(path = %path.display(), "invalid shard id found at path");
                            return Ok(None);
                        }
                    };

                    if let Some(filter) = &store.config.shard_filter {
                        if !filter(&db_name, &rp_name, shard_id) {
                            info!(path = %path.display(), shard = shard_id, "skipping shard");
                            return Ok(None);
                        }
                    }

                    let wal_path = store
                        .config
                        .wal_dir
                        .join(&db_name)
                        .join(&rp_name)
                        .join(&shard_name);
                    let shard = store.builder.build(ShardContext {
                        id: shard_id,
                        database: db_name,
                        retention_policy: rp_name,
                        path: path.clone(),
                        wal_path,
                        series_file: sfile,
                        options,
                    });

                    // Leave the shard disabled until every shard is loaded.
                    if let Err(e) = shard.open().await {
                        error!(shard = shard_id, error = %e, "failed to open shard");
                        return Err(Error::ShardOpen {
                            id: shard_id,
                            source: Box::new(e),
                        });
                    }

                    info!(
                        index_version = shard.index_type(),
                        path = %path.display(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "opened shard"
                    );
                    Ok(Some(shard))
                });
            }
        }
    }

    // Gather the concurrently opened shards; keep the first failure but
    // let every worker finish.
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(Some(shard))) => store.insert_loaded_shard(shard),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                error!(error = %e, "shard open task panicked");
                if first_err.is_none() {
                    first_err = Some(Error::Engine(format!("shard open task failed: {e}")));
                }
            }
        }
    }

    store.warn_mixed_index_types();

    // Enable everything that loaded; release caches on shards that opened
    // cold.
    for sh in store.shards(&store.shard_ids()) {
        sh.set_enabled(true);
        if sh.is_idle() {
            sh.free().await?;
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
