//! Cross-shard catalog queries
//!
//! Measurement names, tag keys, tag values, cardinality estimates, and
//! sketches. Every query snapshots the shards it needs under the read
//! lock, fans out over the snapshot, and merges per-shard results. The
//! cancellation token is polled between shards and between measurements.

use super::{union_series_ids, Store};
use crate::engine::{Authorizer, IndexSet, Shard};
use crate::error::{Error, Result};
use crate::expr::{self, Expr};
use crate::sketch::Sketch;
use crate::types::{KeyValue, ShardId, TagKeys, TagValues};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-shard tag key/value lists for one measurement, prior to merging.
struct ShardTagValues {
    name: String,
    keys: Vec<String>,
    values: Vec<Vec<String>>,
}

impl Store {
    /// All measurement names in `database` matching `cond`, filtered by
    /// the authorizer. Empty when nothing has been written to the
    /// database.
    pub async fn measurement_names(
        &self,
        cancel: &CancellationToken,
        auth: Option<&dyn Authorizer>,
        database: &str,
        cond: Option<&Expr>,
    ) -> Result<Vec<String>> {
        let shards = self.shards_for_database(database);
        let Some(sfile) = self.series_file(database) else {
            return Ok(Vec::new());
        };

        let index_set = IndexSet {
            database: database.to_string(),
            indexes: shards.iter().map(|sh| sh.index()).collect(),
            series_file: sfile,
        };
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        Ok(index_set.measurement_names_by_expr(auth, cond))
    }

    /// Tag keys across the given shards, per measurement, matching `cond`.
    pub async fn tag_keys(
        &self,
        cancel: &CancellationToken,
        auth: Option<&dyn Authorizer>,
        shard_ids: &[ShardId],
        cond: Option<&Expr>,
    ) -> Result<Vec<TagKeys>> {
        if shard_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Split the condition: one part selects measurements (comparisons
        // over `_name`), the other filters series by user tags.
        let measurement_expr = cond.and_then(expr::measurement_expr);
        let filter_expr = cond.and_then(expr::filter_expr);

        let Some((index_set, _shards)) = self.index_set_for_shards(shard_ids) else {
            return Ok(Vec::new());
        };

        let names = index_set.measurement_names_by_expr(None, measurement_expr.as_ref());
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let mut results = Vec::new();
        for name in names {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let keys = index_set.measurement_tag_keys(&name);
            if keys.is_empty() {
                continue;
            }

            // Without a tag filter every key with at least one authorized
            // series is returned.
            if filter_expr.is_none() {
                let mut kept = Vec::with_capacity(keys.len());
                for key in keys {
                    if cancel.is_cancelled() {
                        return Err(Error::Canceled);
                    }
                    if index_set.tag_key_has_authorized_series(auth, &name, &key) {
                        kept.push(key);
                    }
                }
                results.push(TagKeys {
                    measurement: name,
                    keys: kept,
                });
                continue;
            }

            // A key survives the filter when at least one of its values
            // matches.
            let values = index_set.measurement_tag_key_values_by_expr(
                auth,
                &name,
                &keys,
                filter_expr.as_ref(),
            );
            let kept: Vec<String> = keys
                .into_iter()
                .zip(&values)
                .filter(|(_, vals)| !vals.is_empty())
                .map(|(key, _)| key)
                .collect();
            results.push(TagKeys {
                measurement: name,
                keys: kept,
            });
        }
        Ok(results)
    }

    /// Tag keys and values across the given shards, per measurement, where
    /// the values satisfy `cond`. A condition is required.
    pub async fn tag_values(
        &self,
        cancel: &CancellationToken,
        auth: Option<&dyn Authorizer>,
        shard_ids: &[ShardId],
        cond: Option<&Expr>,
    ) -> Result<Vec<TagValues>> {
        let cond = cond.ok_or_else(|| Error::Invalid("a condition is required".to_string()))?;

        let measurement_expr = expr::measurement_expr(cond);
        let filter_expr = expr::filter_expr(cond);

        let Some((index_set, shards)) = self.index_set_for_shards(shard_ids) else {
            return Ok(Vec::new());
        };
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        // Sorted measurement list over the merged view; authorization is
        // applied later against individual series.
        let names = index_set.measurement_names_by_expr(None, measurement_expr.as_ref());

        // Gather one (name, keys, values) triple per shard and
        // measurement.
        let mut all_results: Vec<ShardTagValues> = Vec::new();
        for sh in &shards {
            let shard_set = IndexSet {
                database: index_set.database.clone(),
                indexes: vec![sh.index()],
                series_file: Arc::clone(&index_set.series_file),
            };
            for name in &names {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }

                let mut keys = shard_set.measurement_tag_keys(name);
                if keys.is_empty() {
                    continue;
                }
                let mut values = shard_set.measurement_tag_key_values_by_expr(
                    auth,
                    name,
                    &keys,
                    filter_expr.as_ref(),
                );

                // Drop keys with no surviving values.
                let mut kept = 0;
                for i in 0..keys.len() {
                    if values[i].is_empty() {
                        continue;
                    }
                    keys.swap(kept, i);
                    values.swap(kept, i);
                    kept += 1;
                }
                keys.truncate(kept);
                values.truncate(kept);

                if !keys.is_empty() {
                    all_results.push(ShardTagValues {
                        name: name.clone(),
                        keys,
                        values,
                    });
                }
            }
        }

        all_results.sort_by(|a, b| a.name.cmp(&b.name));

        // Merge the per-shard triples measurement by measurement.
        let mut merged = Vec::new();
        let mut i = 0;
        while i < all_results.len() {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let mut j = i;
            while j + 1 < all_results.len() && all_results[j + 1].name == all_results[i].name {
                j += 1;
            }

            // There can never be more triples for one measurement than
            // shards; more means a broken gather above.
            if j - i + 1 > shards.len() {
                return Err(Error::Invalid(format!(
                    "unexpected results returned by engine: got {} measurement sets for {} shards",
                    j - i + 1,
                    shards.len()
                )));
            }

            let next = merge_tag_values(&all_results[i..=j]);
            i = j + 1;
            if !next.values.is_empty() {
                merged.push(next);
            }
        }
        Ok(merged)
    }

    /// Exact series count for `database`: the cardinality of the union of
    /// every shard's series-id bitset. Not combinable across databases.
    pub async fn series_cardinality(
        &self,
        cancel: &CancellationToken,
        database: &str,
    ) -> Result<i64> {
        let shards = self.shards_for_database(database);
        let union = union_series_ids(shards, cancel).await?;
        Ok(union.cardinality() as i64)
    }

    /// `(items, tombstones)` sketches over all series in `database`;
    /// combinable with sketches for replicas of the same data.
    pub async fn series_sketches(
        &self,
        cancel: &CancellationToken,
        database: &str,
    ) -> Result<(Sketch, Sketch)> {
        self.sketches_for_database(cancel, database, |sh| sh.series_sketches())
            .await
    }

    /// `(items, tombstones)` sketches over all measurements in `database`.
    pub async fn measurements_sketches(
        &self,
        cancel: &CancellationToken,
        database: &str,
    ) -> Result<(Sketch, Sketch)> {
        self.sketches_for_database(cancel, database, |sh| sh.measurements_sketches())
            .await
    }

    /// Estimated measurement count for `database`, from the merged
    /// sketches.
    pub async fn measurements_cardinality(
        &self,
        cancel: &CancellationToken,
        database: &str,
    ) -> Result<i64> {
        let (items, tombstones) = self.measurements_sketches(cancel, database).await?;
        Ok(items.count().saturating_sub(tombstones.count()) as i64)
    }

    async fn sketches_for_database(
        &self,
        cancel: &CancellationToken,
        database: &str,
        sketches: impl Fn(&dyn Shard) -> Result<(Sketch, Sketch)>,
    ) -> Result<(Sketch, Sketch)> {
        let shards = self.shards_for_database(database);

        // Never return nothing: a database with no shards gets empty
        // sketches of the default flavor.
        let mut items = Sketch::new();
        let mut tombstones = Sketch::new();
        for sh in shards {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let (s, t) = sketches(sh.as_ref())?;
            items.merge(&s)?;
            tombstones.merge(&t)?;
        }
        Ok((items, tombstones))
    }

    /// Build the merged index view over the requested shard ids; `None`
    /// when none of them are present.
    fn index_set_for_shards(
        &self,
        shard_ids: &[ShardId],
    ) -> Option<(IndexSet, Vec<Arc<dyn Shard>>)> {
        let shards = self.shards(shard_ids);
        let first = shards.first()?;
        let index_set = IndexSet {
            database: first.database().to_string(),
            indexes: shards.iter().map(|sh| sh.index()).collect(),
            series_file: first.series_file(),
        };
        Some((index_set, shards))
    }
}

/// K-way merge of per-shard tag values for one measurement: repeatedly
/// emit the smallest `(key, value)` pair, folding duplicates seen across
/// shards into one.
fn merge_tag_values(tvs: &[ShardTagValues]) -> TagValues {
    let Some(first) = tvs.first() else {
        return TagValues {
            measurement: String::new(),
            values: Vec::new(),
        };
    };
    let measurement = first.name.clone();

    if tvs.len() == 1 {
        let mut values = Vec::new();
        for (ki, key) in first.keys.iter().enumerate() {
            for value in &first.values[ki] {
                values.push(KeyValue::new(key.clone(), value.clone()));
            }
        }
        return TagValues {
            measurement,
            values,
        };
    }

    // (key index, value index) per shard.
    let mut cursors = vec![(0usize, 0usize); tvs.len()];
    let mut values = Vec::new();

    let advance = |cursors: &mut Vec<(usize, usize)>, i: usize, tv: &ShardTagValues| {
        let (ki, vi) = cursors[i];
        if vi + 1 >= tv.values[ki].len() {
            cursors[i] = (ki + 1, 0);
        } else {
            cursors[i] = (ki, vi + 1);
        }
    };

    loop {
        // Pick the shard currently holding the smallest (key, value).
        let mut smallest: Option<usize> = None;
        for i in 0..tvs.len() {
            let (ki, _) = cursors[i];
            if ki >= tvs[i].keys.len() {
                continue; // Shard fully drained.
            }
            if tvs[i].values[ki].is_empty() {
                cursors[i] = (ki + 1, 0); // Key with no values; skip it.
                continue;
            }
            let Some(j) = smallest else {
                smallest = Some(i);
                continue;
            };

            let (ki, vi) = cursors[i];
            let (kj, vj) = cursors[j];
            match tvs[i].keys[ki].cmp(&tvs[j].keys[kj]) {
                Ordering::Less => smallest = Some(i),
                Ordering::Greater => {}
                Ordering::Equal => match tvs[i].values[ki][vi].cmp(&tvs[j].values[kj][vj]) {
                    Ordering::Less => smallest = Some(i),
                    Ordering::Greater => {}
                    // Duplicate pair across shards: emit once, drop ours.
                    Ordering::Equal => advance(&mut cursors, i, &tvs[i]),
                },
            }
        }

        let Some(j) = smallest else {
            break; // Every shard drained.
        };
        let (kj, vj) = cursors[j];
        values.push(KeyValue::new(
            tvs[j].keys[kj].clone(),
            tvs[j].values[kj][vj].clone(),
        ));
        advance(&mut cursors, j, &tvs[j]);
    }

    TagValues {
        measurement,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv(name: &str, entries: &[(&str, &[&str])]) -> ShardTagValues {
        ShardTagValues {
            name: name.to_string(),
            keys: entries.iter().map(|(k, _)| k.to_string()).collect(),
            values: entries
                .iter()
                .map(|(_, vals)| vals.iter().map(|v| v.to_string()).collect())
                .collect(),
        }
    }

    fn pairs(merged: &TagValues) -> Vec<(String, String)> {
        merged
            .values
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }

    #[test]
    fn merge_single_shard_flattens() {
        let merged = merge_tag_values(&[tv("cpu", &[("host", &["a", "b"]), ("region", &["w"])])]);
        assert_eq!(merged.measurement, "cpu");
        assert_eq!(
            pairs(&merged),
            vec![
                ("host".to_string(), "a".to_string()),
                ("host".to_string(), "b".to_string()),
                ("region".to_string(), "w".to_string()),
            ]
        );
    }

    #[test]
    fn merge_removes_cross_shard_duplicates() {
        let merged = merge_tag_values(&[
            tv("cpu", &[("host", &["a", "c"])]),
            tv("cpu", &[("host", &["a", "b"])]),
        ]);
        assert_eq!(
            pairs(&merged),
            vec![
                ("host".to_string(), "a".to_string()),
                ("host".to_string(), "b".to_string()),
                ("host".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn merge_interleaves_keys() {
        let merged = merge_tag_values(&[
            tv("cpu", &[("az", &["1"]), ("host", &["b"])]),
            tv("cpu", &[("host", &["a"]), ("rack", &["r9"])]),
        ]);
        assert_eq!(
            pairs(&merged),
            vec![
                ("az".to_string(), "1".to_string()),
                ("host".to_string(), "a".to_string()),
                ("host".to_string(), "b".to_string()),
                ("rack".to_string(), "r9".to_string()),
            ]
        );
    }

    #[test]
    fn merge_skips_drained_keys() {
        let merged = merge_tag_values(&[
            tv("cpu", &[("empty", &[]), ("host", &["a"])]),
            tv("cpu", &[("host", &["a"])]),
        ]);
        assert_eq!(pairs(&merged), vec![("host".to_string(), "a".to_string())]);
    }

    #[test]
    fn merge_of_three_shards_stays_sorted() {
        let merged = merge_tag_values(&[
            tv("m", &[("k", &["b", "d"])]),
            tv("m", &[("k", &["a", "d"])]),
            tv("m", &[("k", &["c"])]),
        ]);
        assert_eq!(
            pairs(&merged),
            vec![
                ("k".to_string(), "a".to_string()),
                ("k".to_string(), "b".to_string()),
                ("k".to_string(), "c".to_string()),
                ("k".to_string(), "d".to_string()),
            ]
        );
    }
}
