//! Calendar-bucketed cache partitions.
//!
//! Every missing range of a batch is cut along its view's partition unit
//! (day, month, or year). Each bucket maps to one store key holding the
//! series data cached for that bucket:
//!
//! ```json
//! {"Data": [1.0, null], "DataFormat": ["ValueSum", "ItemCount"], "DataFrom": "2020-01-01T00:30:00Z"}
//! ```
//!
//! `DataFrom` is present only when the data starts after the bucket start.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cache::KeyValueCache;
use crate::interval::{merge_data, union, Grid};
use crate::item::FetchItem;
use crate::types::{DataFormat, SeriesChunk, TimeRange};
use crate::wire::{format_time, parse_time};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StoredPartition {
    data: Vec<Option<f64>>,
    #[serde(default)]
    data_format: DataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_from: Option<String>,
}

/// One calendar bucket of one series, with the batch items it serves.
#[derive(Debug)]
pub(crate) struct CachePartition {
    pub key_id: String,
    pub key_range: TimeRange,
    pub cache_key_base: String,
    pub point_duration: i64,
    pub measurement_id: i64,
    pub view: Option<String>,
    /// Indices into the batch's item list.
    pub items: Vec<usize>,
    /// Working buffer spanning `[loaded from, bucket end)`.
    pub data: Option<SeriesChunk>,
    /// What the store actually held.
    pub loaded: Option<SeriesChunk>,
    pub is_modified: bool,
}

impl CachePartition {
    /// Whether the bucket still lacks data up to its end.
    pub fn is_incomplete(&self) -> bool {
        self.loaded
            .as_ref()
            .map_or(true, |loaded| loaded.range.to < self.key_range.to)
    }

    /// Range the server should be asked for to complete this bucket.
    pub fn missing_tail(&self) -> TimeRange {
        match &self.loaded {
            Some(loaded) => TimeRange::new(loaded.range.to, self.key_range.to),
            None => self.key_range,
        }
    }

    /// Merge a server chunk. Format mismatches are ignored here; the items
    /// reading the same chunk report them.
    pub fn merge(&mut self, chunk: &SeriesChunk, requested_from: i64) -> bool {
        if self.data.is_none() {
            let Some(seed) = union(chunk.range, self.key_range) else {
                return false;
            };
            self.data = Some(SeriesChunk {
                data: Vec::new(),
                format: chunk.format.clone(),
                range: seed,
            });
        }
        let Some(target) = self.data.as_mut() else {
            return false;
        };
        if target.format != chunk.format {
            return false;
        }

        let grid = Grid::new(self.point_duration, target.format.point_size());
        let merged = merge_data(
            &mut target.data,
            &mut target.range,
            &chunk.data,
            chunk.range,
            grid,
            requested_from,
            self.key_range.from,
        );
        if merged.is_some() {
            self.is_modified = true;
        }
        merged.is_some()
    }

    /// Persist the working buffer if it changed.
    pub fn save(&mut self, cache: &KeyValueCache) {
        if !self.is_modified {
            return;
        }
        let Some(data) = &self.data else {
            return;
        };
        let stored = StoredPartition {
            data: data.data.clone(),
            data_format: data.format.clone(),
            data_from: (data.range.from > self.key_range.from).then(|| format_time(data.range.from)),
        };
        match serde_json::to_string(&stored) {
            Ok(json) => {
                cache.put(&self.key_id, &json);
            }
            Err(e) => tracing::warn!("Failed to encode cache partition {}: {e}", self.key_id),
        }
        self.is_modified = false;
    }
}

/// Read a stored partition. Unreadable entries count as absent.
fn load(cache: &KeyValueCache, key_id: &str, point_duration: i64, key_from: i64) -> Option<SeriesChunk> {
    let raw = cache.get(key_id)?;
    let stored: StoredPartition = match serde_json::from_str(&raw) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::warn!("Ignoring corrupt cache entry {key_id}: {e}");
            return None;
        }
    };
    let from = stored
        .data_from
        .as_deref()
        .and_then(parse_time)
        .unwrap_or(key_from);
    let points = (stored.data.len() / stored.data_format.point_size()) as i64;
    Some(SeriesChunk {
        range: TimeRange::new(from, from + points * point_duration),
        data: stored.data,
        format: stored.data_format,
    })
}

/// Partition the missing ranges of `items` and load what the store holds.
///
/// Buckets lying entirely before the point where a series' stored data is
/// known to begin are dropped: the server has nothing there.
pub(crate) fn build_index(items: &[FetchItem], cache: &KeyValueCache) -> Vec<CachePartition> {
    let mut partitions: Vec<CachePartition> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for (idx, item) in items.iter().enumerate() {
        let plan = &item.plan;
        for range in &item.missing {
            for bucket in plan.partition.split(*range) {
                let key_id = format!("{}{}", plan.cache_key_base, plan.partition.format(bucket.from));
                let slot = *by_key.entry(key_id.clone()).or_insert_with(|| {
                    partitions.push(CachePartition {
                        key_id,
                        key_range: bucket,
                        cache_key_base: plan.cache_key_base.clone(),
                        point_duration: plan.point_duration,
                        measurement_id: item.query.measurement_id,
                        view: plan.view.clone(),
                        items: Vec::new(),
                        data: None,
                        loaded: None,
                        is_modified: false,
                    });
                    partitions.len() - 1
                });
                let owners = &mut partitions[slot].items;
                if !owners.contains(&idx) {
                    owners.push(idx);
                }
            }
        }
    }

    let mut known_start: HashMap<String, i64> = HashMap::new();
    for partition in &mut partitions {
        let Some(loaded) = load(cache, &partition.key_id, partition.point_duration, partition.key_range.from) else {
            continue;
        };
        if loaded.range.from > partition.key_range.from {
            known_start.insert(partition.cache_key_base.clone(), loaded.range.from);
        }
        partition.data = Some(SeriesChunk {
            data: loaded.data.clone(),
            format: loaded.format.clone(),
            range: TimeRange::new(loaded.range.from, partition.key_range.to),
        });
        partition.loaded = Some(loaded);
    }

    partitions.retain(|p| {
        known_start
            .get(&p.cache_key_base)
            .map_or(true, |start| p.key_range.to > *start)
    });
    tracing::debug!("Built {} cache partitions", partitions.len());
    partitions
}
