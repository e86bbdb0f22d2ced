//! End-to-end store tests
//!
//! These exercise the full lifecycle against real temp directories and the
//! in-memory reference engine: parallel open, create/delete of shards and
//! namespaces, write/delete serialization, catalog queries, cardinality,
//! and the idle-shard monitor.

use shardstore::engine::memory::{MemShard, MemShardBuilder};
use shardstore::engine::Shard;
use shardstore::expr::Expr;
use shardstore::store::Store;
use shardstore::types::{Point, MAX_TIME, MIN_TIME};
use shardstore::{Error, StoreConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    store: Arc<Store>,
    builder: Arc<MemShardBuilder>,
    data: TempDir,
    wal: TempDir,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_builder(Arc::new(MemShardBuilder::new()), true).await
    }

    async fn with_builder(builder: Arc<MemShardBuilder>, monitor_disabled: bool) -> Self {
        let data = TempDir::new().unwrap();
        let wal = TempDir::new().unwrap();
        let mut config = StoreConfig::new(wal.path());
        config.monitor_disabled = monitor_disabled;
        let store = Store::new(data.path(), config, builder.clone());
        store.open().await.unwrap();
        Self {
            store,
            builder,
            data,
            wal,
        }
    }

    async fn reopen(&self) {
        self.store.close().await.unwrap();
        self.store.open().await.unwrap();
    }

    fn mem_shard(&self, id: u64) -> Arc<MemShard> {
        self.builder
            .built_shards()
            .into_iter()
            .rev()
            .find(|sh| sh.id() == id)
            .expect("shard was never built")
    }
}

fn never() -> CancellationToken {
    CancellationToken::new()
}

fn pt(measurement: &str, tags: &[(&str, &str)], ts: i64, value: f64) -> Point {
    let mut point = Point::new(measurement, ts, value);
    for (k, v) in tags {
        point = point.with_tag(*k, *v);
    }
    point
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn create_shards_and_delete_retention_policy() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    fx.store.create_shard("db0", "rp1", 3, true).await.unwrap();
    assert_eq!(fx.store.shard_n(), 3);

    fx.store
        .delete_retention_policy("db0", "rp0")
        .await
        .unwrap();

    assert!(fx.store.shard(1).is_none());
    assert!(fx.store.shard(2).is_none());
    assert!(fx.store.shard(3).is_some());
    assert!(!fx.data.path().join("db0/rp0").exists());
    assert!(!fx.wal.path().join("db0/rp0").exists());
    assert!(fx.data.path().join("db0/rp1").exists());

    // Deleting it again is a no-op.
    fx.store
        .delete_retention_policy("db0", "rp0")
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_shard_purges_series_unique_to_it() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    fx.store.create_shard("db1", "rp0", 3, true).await.unwrap();

    // serverb only lives in shard 1; servera and serverc live in shard 2.
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("serverb", "b")], 100, 1.0)])
        .await
        .unwrap();
    fx.store
        .write_to_shard(
            2,
            &[
                pt("cpu", &[("servera", "a")], 100, 1.0),
                pt("mem", &[("serverc", "a")], 100, 1.0),
            ],
        )
        .await
        .unwrap();
    // db1 carries the same series key as shard 1, in its own series file.
    fx.store
        .write_to_shard(3, &[pt("cpu", &[("serverb", "b")], 100, 1.0)])
        .await
        .unwrap();

    fx.store.delete_shard(1).await.unwrap();
    assert!(fx.store.shard(1).is_none());

    let keys = fx
        .store
        .tag_keys(&never(), None, &[2], None)
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].measurement, "cpu");
    assert_eq!(keys[0].keys, vec!["servera"]);
    assert_eq!(keys[1].measurement, "mem");
    assert_eq!(keys[1].keys, vec!["serverc"]);

    // The series unique to shard 1 left db0's series file.
    let sfile = fx.store.shard(2).unwrap().series_file();
    assert_eq!(sfile.series_id("cpu,serverb=b"), None);
    assert_eq!(sfile.series_count(), 2);

    // The same series key in db1 is untouched.
    let db1_sfile = fx.store.shard(3).unwrap().series_file();
    assert!(db1_sfile.series_id("cpu,serverb=b").is_some());
    assert_eq!(
        fx.store.series_cardinality(&never(), "db1").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn delete_shard_twice_then_recreate() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();

    fx.store.delete_shard(1).await.unwrap();
    fx.store.delete_shard(1).await.unwrap();

    // The pending-deletion flag must be cleared once the delete finishes.
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    assert!(fx.store.shard(1).is_some());
}

#[tokio::test]
async fn create_shard_is_idempotent() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    assert_eq!(fx.store.shard_n(), 1);
}

#[tokio::test]
async fn delete_database_removes_everything() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp1", 2, true).await.unwrap();
    fx.store.create_shard("db1", "rp0", 3, true).await.unwrap();
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();

    fx.store.delete_database("db0").await.unwrap();

    assert!(fx.store.shard(1).is_none());
    assert!(fx.store.shard(2).is_none());
    assert!(fx.store.shard(3).is_some());
    assert!(!fx.data.path().join("db0").exists());
    assert!(!fx.wal.path().join("db0").exists());
    assert_eq!(fx.store.databases(), vec!["db1"]);
}

#[tokio::test]
async fn delete_missing_database_is_noop() {
    let fx = Fixture::new().await;
    fx.store.delete_database("nope").await.unwrap();
}

#[tokio::test]
async fn delete_retention_policy_refuses_path_escape() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();

    let err = fx
        .store
        .delete_retention_policy("db0", "..")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PathEscape { .. }), "got {err}");
    // Nothing was removed.
    assert!(fx.data.path().join("db0/rp0/1").exists());
}

#[tokio::test]
async fn closed_store_refuses_operations() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.close().await.unwrap();

    let err = fx
        .store
        .create_shard("db0", "rp0", 2, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StoreClosed));

    let err = fx
        .store
        .write_to_shard(1, &[pt("cpu", &[], 1, 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StoreClosed));

    // Reopening brings the store back.
    fx.store.open().await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
}

#[tokio::test]
async fn write_to_unknown_shard_fails() {
    let fx = Fixture::new().await;
    let err = fx
        .store
        .write_to_shard(42, &[pt("cpu", &[], 1, 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardNotFound(42)));
}

#[tokio::test]
async fn disabled_shard_refuses_writes() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.set_shard_enabled(1, false).unwrap();
    assert!(fx
        .store
        .write_to_shard(1, &[pt("cpu", &[], 1, 1.0)])
        .await
        .is_err());

    fx.store.set_shard_enabled(1, true).unwrap();
    fx.store
        .write_to_shard(1, &[pt("cpu", &[], 1, 1.0)])
        .await
        .unwrap();
}

#[tokio::test]
async fn shard_relative_path_is_db_rp_id() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 7, true).await.unwrap();
    assert_eq!(fx.store.shard_relative_path(7).unwrap(), "db0/rp0/7");
    assert!(matches!(
        fx.store.shard_relative_path(8),
        Err(Error::ShardNotFound(8))
    ));
}

// ============================================================================
// Loader boundaries
// ============================================================================

#[tokio::test]
async fn open_ignores_non_numeric_shard_dirs_and_stray_files() {
    let data = TempDir::new().unwrap();
    let wal = TempDir::new().unwrap();

    std::fs::create_dir_all(data.path().join("db0/rp0/2")).unwrap();
    std::fs::create_dir_all(data.path().join("db0/rp0/abc")).unwrap();
    std::fs::write(data.path().join("stray.txt"), b"x").unwrap();
    std::fs::write(data.path().join("db0/notes.txt"), b"x").unwrap();

    let builder = Arc::new(MemShardBuilder::new());
    let mut config = StoreConfig::new(wal.path());
    config.monitor_disabled = true;
    let store = Store::new(data.path(), config, builder);
    store.open().await.unwrap();

    assert_eq!(store.shard_ids(), vec![2]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn reopen_discovers_created_shards() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp1", 2, true).await.unwrap();

    fx.reopen().await;

    let mut ids = fx.store.shard_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    // Rediscovered shards accept writes.
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();
}

#[tokio::test]
async fn database_filter_restricts_loading() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db1", "rp0", 2, true).await.unwrap();
    fx.store.close().await.unwrap();

    let builder = Arc::new(MemShardBuilder::new());
    let mut config = StoreConfig::new(fx.wal.path());
    config.monitor_disabled = true;
    config.database_filter = Some(Arc::new(|db: &str| db == "db1"));
    let store = Store::new(fx.data.path(), config, builder);
    store.open().await.unwrap();

    assert_eq!(store.shard_ids(), vec![2]);
    store.close().await.unwrap();
}

// ============================================================================
// Write/delete serialization
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_and_measurement_deletes() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    fx.store
        .write_to_shard(1, &[pt("mem", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();

    let writer = {
        let store = Arc::clone(&fx.store);
        tokio::spawn(async move {
            for i in 0..50i64 {
                store
                    .write_to_shard(1, &[pt("cpu", &[("server", "a")], i, 1.0)])
                    .await
                    .unwrap();
                store
                    .write_to_shard(2, &[pt("cpu", &[("server", "b")], i, 1.0)])
                    .await
                    .unwrap();
            }
        })
    };
    let deleter = {
        let store = Arc::clone(&fx.store);
        tokio::spawn(async move {
            for _ in 0..50 {
                store.delete_measurement("db0", "cpu").await.unwrap();
            }
        })
    };
    writer.await.unwrap();
    deleter.await.unwrap();

    fx.store.delete_measurement("db0", "cpu").await.unwrap();

    let names = fx
        .store
        .measurement_names(&never(), None, "db0", None)
        .await
        .unwrap();
    assert_eq!(names, vec!["mem"]);
}

#[tokio::test]
async fn delete_series_respects_time_bounds() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store
        .write_to_shard(
            1,
            &[
                pt("cpu", &[("host", "a")], 10, 1.0),
                pt("cpu", &[("host", "a")], 100, 2.0),
            ],
        )
        .await
        .unwrap();

    // time >= 50 scopes the delete to the later point.
    let cond = Expr::binary(
        shardstore::expr::Op::GtEq,
        Expr::var("time"),
        Expr::integer(50),
    );
    fx.store
        .delete_series("db0", &["cpu".to_string()], Some(&cond))
        .await
        .unwrap();

    let shard = fx.mem_shard(1);
    let sfile = fx.store.shard(1).unwrap().series_file();
    let id = sfile.series_id("cpu,host=a").unwrap();
    assert_eq!(shard.series_points(id), vec![(10, 1.0)]);

    // Unbounded delete drops the series entirely.
    fx.store
        .delete_series("db0", &[], None)
        .await
        .unwrap();
    assert_eq!(
        fx.store.series_cardinality(&never(), "db0").await.unwrap(),
        0
    );
}

// ============================================================================
// Mixed index types
// ============================================================================

#[tokio::test]
async fn mixed_index_types_refuse_deletes_but_allow_creates() {
    let builder = Arc::new(MemShardBuilder::with_index_type(|id| {
        if id % 2 == 0 {
            "tsi1".to_string()
        } else {
            "inmem".to_string()
        }
    }));
    let fx = Fixture::with_builder(builder, true).await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();

    // Deletes are refused while the database mixes index types.
    let err = fx.store.delete_series("db0", &[], None).await.unwrap_err();
    assert!(matches!(err, Error::MultipleIndexTypes(_)));
    let err = fx
        .store
        .delete_measurement("db0", "cpu")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MultipleIndexTypes(_)));

    // Creating another shard still succeeds (a warning is logged).
    fx.store.create_shard("db0", "rp0", 3, true).await.unwrap();

    // The mix survives a reopen via the loader.
    fx.reopen().await;
    let err = fx.store.delete_series("db0", &[], None).await.unwrap_err();
    assert!(matches!(err, Error::MultipleIndexTypes(_)));
}

// ============================================================================
// Catalog queries
// ============================================================================

#[tokio::test]
async fn measurement_names_empty_without_writes() {
    let fx = Fixture::new().await;
    let names = fx
        .store
        .measurement_names(&never(), None, "db0", None)
        .await
        .unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn tag_values_sorted_and_deduplicated() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();

    // host=a appears in both shards; the merge must emit it once.
    fx.store
        .write_to_shard(
            1,
            &[
                pt("cpu", &[("host", "a")], 1, 1.0),
                pt("cpu", &[("host", "c")], 1, 1.0),
            ],
        )
        .await
        .unwrap();
    fx.store
        .write_to_shard(
            2,
            &[
                pt("cpu", &[("host", "a")], 1, 1.0),
                pt("cpu", &[("host", "b"), ("az", "1")], 1, 1.0),
            ],
        )
        .await
        .unwrap();

    let cond = Expr::measurement_eq("cpu");
    let values = fx
        .store
        .tag_values(&never(), None, &[1, 2], Some(&cond))
        .await
        .unwrap();

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].measurement, "cpu");
    let pairs: Vec<(String, String)> = values[0]
        .values
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("az".to_string(), "1".to_string()),
            ("host".to_string(), "a".to_string()),
            ("host".to_string(), "b".to_string()),
            ("host".to_string(), "c".to_string()),
        ]
    );

    // Output is sorted with no duplicate triples.
    let mut sorted = pairs.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(pairs, sorted);
}

#[tokio::test]
async fn tag_values_requires_condition() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    let err = fx
        .store
        .tag_values(&never(), None, &[1], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn tag_keys_filters_by_measurement_condition() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store
        .write_to_shard(
            1,
            &[
                pt("cpu", &[("host", "a")], 1, 1.0),
                pt("mem", &[("node", "n1")], 1, 1.0),
            ],
        )
        .await
        .unwrap();

    let cond = Expr::measurement_eq("cpu");
    let keys = fx
        .store
        .tag_keys(&never(), None, &[1], Some(&cond))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].measurement, "cpu");
    assert_eq!(keys[0].keys, vec!["host"]);
}

#[tokio::test]
async fn cancelled_queries_return_canceled() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
        .store
        .tag_keys(&cancel, None, &[1], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));

    let err = fx
        .store
        .series_cardinality(&cancel, "db0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));

    // A shard with no measurements must still surface the cancellation,
    // not an empty result.
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    let err = fx
        .store
        .tag_keys(&cancel, None, &[2], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));

    let cond = Expr::measurement_eq("cpu");
    let err = fx
        .store
        .tag_values(&cancel, None, &[2], Some(&cond))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));
}

// ============================================================================
// Cardinality
// ============================================================================

#[tokio::test]
async fn series_cardinality_is_exact_across_shards() {
    let fx = Fixture::new().await;
    const SHARDS: u64 = 10;
    const PER_SHARD: u64 = 2_000;

    // db0: every shard holds distinct series.
    for shard_id in 1..=SHARDS {
        fx.store
            .create_shard("db0", "rp0", shard_id, true)
            .await
            .unwrap();
        let points: Vec<Point> = (0..PER_SHARD)
            .map(|i| {
                let host = format!("h{}", (shard_id - 1) * PER_SHARD + i);
                pt("cpu", &[("host", host.as_str())], i as i64, 1.0)
            })
            .collect();
        fx.store.write_to_shard(shard_id, &points).await.unwrap();
    }

    assert_eq!(
        fx.store.series_cardinality(&never(), "db0").await.unwrap(),
        (SHARDS * PER_SHARD) as i64
    );
    assert_eq!(
        fx.store
            .measurements_cardinality(&never(), "db0")
            .await
            .unwrap(),
        1
    );

    // db1: the same series duplicated into every shard unions exactly.
    let points: Vec<Point> = (0..PER_SHARD)
        .map(|i| {
            let host = format!("h{i}");
            pt("cpu", &[("host", host.as_str())], i as i64, 1.0)
        })
        .collect();
    for shard_id in 101..=(100 + SHARDS) {
        fx.store
            .create_shard("db1", "rp0", shard_id, true)
            .await
            .unwrap();
        fx.store.write_to_shard(shard_id, &points).await.unwrap();
    }
    assert_eq!(
        fx.store.series_cardinality(&never(), "db1").await.unwrap(),
        PER_SHARD as i64
    );

    // Sketch-based estimation stays within HLL error.
    let (items, tombstones) = fx.store.series_sketches(&never(), "db0").await.unwrap();
    let estimate = items.count().saturating_sub(tombstones.count()) as f64;
    let exact = (SHARDS * PER_SHARD) as f64;
    assert!(
        (estimate - exact).abs() / exact < 0.015,
        "estimate {estimate} too far from {exact}"
    );
}

#[tokio::test]
async fn sketches_present_without_shards() {
    let fx = Fixture::new().await;
    let (items, tombstones) = fx
        .store
        .measurements_sketches(&never(), "db-without-shards")
        .await
        .unwrap();
    assert_eq!(items.count(), 0);
    assert_eq!(tombstones.count(), 0);
}

// ============================================================================
// Backup / restore
// ============================================================================

#[tokio::test]
async fn backup_then_restore_into_empty_shard() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store.create_shard("db0", "rp0", 2, true).await.unwrap();
    fx.store
        .write_to_shard(
            1,
            &[
                pt("cpu", &[("host", "a")], 10, 1.0),
                pt("mem", &[("host", "b")], 20, 2.0),
            ],
        )
        .await
        .unwrap();

    let mut stream = std::io::Cursor::new(Vec::new());
    fx.store.backup_shard(1, MIN_TIME, &mut stream).await.unwrap();
    fx.store
        .restore_shard(2, &mut std::io::Cursor::new(stream.into_inner()))
        .await
        .unwrap();

    assert_eq!(
        fx.store.shard_digest(1).await.unwrap(),
        fx.store.shard_digest(2).await.unwrap()
    );

    // Export honors the time range.
    let mut exported = std::io::Cursor::new(Vec::new());
    fx.store
        .export_shard(1, 15, MAX_TIME, &mut exported)
        .await
        .unwrap();
    let text = String::from_utf8(exported.into_inner()).unwrap();
    assert!(text.contains("mem,host=b"));
    assert!(!text.contains("cpu,host=a"));

    assert!(matches!(
        fx.store
            .backup_shard(99, MIN_TIME, &mut std::io::Cursor::new(Vec::new()))
            .await,
        Err(Error::ShardNotFound(99))
    ));
}

// ============================================================================
// Monitor and statistics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn monitor_reenables_compactions_and_leaves_idle_shards_cold() {
    let builder = Arc::new(MemShardBuilder::new());
    let fx = Fixture::with_builder(Arc::clone(&builder), false).await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    let shard = fx.mem_shard(1);

    // A warm shard gets compactions turned back on every tick, even if an
    // operator disabled them.
    fx.store
        .write_to_shard(1, &[pt("cpu", &[("host", "a")], 1, 1.0)])
        .await
        .unwrap();
    shard.set_compactions_enabled(false);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(shard.compactions_enabled());

    // A cold shard is freed instead; its compactions stay paused.
    shard.free().await.unwrap();
    shard.set_compactions_enabled(false);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(shard.is_idle());
    assert!(!shard.compactions_enabled());

    fx.store.close().await.unwrap();
}

#[tokio::test]
async fn statistics_report_database_cardinalities() {
    let fx = Fixture::new().await;
    fx.store.create_shard("db0", "rp0", 1, true).await.unwrap();
    fx.store
        .write_to_shard(
            1,
            &[
                pt("cpu", &[("host", "a")], 1, 1.0),
                pt("cpu", &[("host", "b")], 1, 1.0),
            ],
        )
        .await
        .unwrap();

    let stats = fx.store.statistics(&BTreeMap::new()).await;
    let db_stat = stats
        .iter()
        .find(|s| s.name == "database" && s.tags.get("database") == Some(&"db0".to_string()))
        .expect("missing database statistic");
    assert_eq!(db_stat.values.get("numSeries"), Some(&2));
    assert_eq!(db_stat.values.get("numMeasurements"), Some(&1));

    assert!(stats.iter().any(|s| s.name == "shard"));
}
