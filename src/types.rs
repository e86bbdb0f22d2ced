//! Core data types shared across the shard store
//!
//! This module defines the fundamental structures the store coordinates:
//!
//! - **`Point`**: a single measurement sample (measurement + tags + timestamp + value)
//! - **`TagSet`**: ordered key-value metadata attached to a series
//! - **`TimeRange`**: an inclusive nanosecond time window
//! - **`ShardId`** / **`SeriesId`**: 64-bit identifiers
//! - **`TagKeys`** / **`TagValues`**: merged results of cross-shard metadata queries

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a shard within a store.
pub type ShardId = u64;

/// Unique identifier for a series, allocated by a database's series file.
pub type SeriesId = u64;

/// Smallest usable timestamp, in nanoseconds since the epoch.
///
/// The two lowest i64 values are reserved as sentinels by the storage
/// engines, matching the range accepted on the write path.
pub const MIN_TIME: i64 = i64::MIN + 2;

/// Largest usable timestamp, in nanoseconds since the epoch.
pub const MAX_TIME: i64 = i64::MAX - 1;

/// An ordered set of tag key-value pairs.
///
/// Tags are kept sorted by key so that series keys serialize
/// deterministically and index scans iterate in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a tag value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of tags in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set holds no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A single time-series sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Measurement the point belongs to.
    pub measurement: String,
    /// Tag set identifying the series within the measurement.
    pub tags: TagSet,
    /// Timestamp in nanoseconds since the epoch.
    pub timestamp: i64,
    /// Field value.
    pub value: f64,
}

impl Point {
    /// Create a point with no tags.
    pub fn new(measurement: impl Into<String>, timestamp: i64, value: f64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: TagSet::new(),
            timestamp,
            value,
        }
    }

    /// Add a tag, builder style.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    /// The canonical series key: `measurement,key=value,...` with tags in
    /// key order. Two points with the same series key belong to the same
    /// series.
    pub fn series_key(&self) -> String {
        series_key(&self.measurement, &self.tags)
    }
}

/// Build a canonical series key from a measurement name and tag set.
pub fn series_key(measurement: &str, tags: &TagSet) -> String {
    let mut key = String::with_capacity(measurement.len() + tags.len() * 16);
    key.push_str(measurement);
    for (k, v) in tags.iter() {
        key.push(',');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// Split a canonical series key back into measurement and tags.
pub fn parse_series_key(key: &str) -> (String, TagSet) {
    let mut parts = key.split(',');
    let measurement = parts.next().unwrap_or_default().to_string();
    let tags = parts.filter_map(|p| p.split_once('=')).collect::<TagSet>();
    (measurement, tags)
}

/// An inclusive time window in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the window, inclusive.
    pub min: i64,
    /// End of the window, inclusive.
    pub max: i64,
}

impl TimeRange {
    /// Create a range from `min` to `max` inclusive.
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// The widest representable range.
    pub fn unbounded() -> Self {
        Self {
            min: MIN_TIME,
            max: MAX_TIME,
        }
    }

    /// True when `ts` falls inside the range.
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.min && ts <= self.max
    }

    /// True when the range spans every usable timestamp.
    pub fn is_unbounded(&self) -> bool {
        self.min <= MIN_TIME && self.max >= MAX_TIME
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Tag keys found for one measurement across a set of shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagKeys {
    /// Measurement name.
    pub measurement: String,
    /// Sorted tag keys.
    pub keys: Vec<String>,
}

/// A tag key paired with one of its values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyValue {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl KeyValue {
    /// Convenience constructor.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Tag key/value pairs found for one measurement across a set of shards,
/// sorted by `(key, value)` with duplicates removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValues {
    /// Measurement name.
    pub measurement: String,
    /// Sorted, de-duplicated key/value pairs.
    pub values: Vec<KeyValue>,
}

/// A named group of integer statistics with identifying tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistic {
    /// Statistic group name, e.g. `"database"` or `"shard"`.
    pub name: String,
    /// Identifying tags, e.g. the database name.
    pub tags: BTreeMap<String, String>,
    /// Statistic values by name.
    pub values: BTreeMap<String, i64>,
}
