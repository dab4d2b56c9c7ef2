//! Interval arithmetic over half-open millisecond ranges and flattened point buffers.

use std::collections::BTreeMap;

use crate::types::TimeRange;

/// Sampling grid of a series: how long one point lasts and how many values it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub point_duration: i64,
    pub point_size: usize,
}

impl Grid {
    pub fn new(point_duration: i64, point_size: usize) -> Self {
        Self {
            point_duration,
            point_size: point_size.max(1),
        }
    }
}

/// Floor `from` and ceil `to` to multiples of `point_duration`.
pub fn align_to_grid(range: TimeRange, point_duration: i64) -> TimeRange {
    if point_duration <= 0 {
        return range;
    }
    let from = range.from - range.from.rem_euclid(point_duration);
    let rem = range.to.rem_euclid(point_duration);
    let to = if rem == 0 {
        range.to
    } else {
        range.to - rem + point_duration
    };
    TimeRange { from, to }
}

/// Copy the overlap of `source` into `target` at matching point indices.
///
/// Returns the merged range, or `None` when the ranges do not intersect.
/// When the overlap starts exactly at `source_range.from` and that instant lies
/// after `source_requested_from`, the source is known to hold nothing earlier:
/// the target's leading points are dropped, `target_range.from` moves up to the
/// overlap, and the returned range is widened back to `target_requested_from`
/// so callers treat the dropped head as answered.
pub fn merge_data(
    target: &mut Vec<Option<f64>>,
    target_range: &mut TimeRange,
    source: &[Option<f64>],
    source_range: TimeRange,
    grid: Grid,
    source_requested_from: i64,
    target_requested_from: i64,
) -> Option<TimeRange> {
    let pd = grid.point_duration;
    let ps = grid.point_size;
    if pd <= 0 {
        return None;
    }

    let final_from = target_range.from.div_euclid(pd);
    let final_to = target_range.to.div_euclid(pd);
    let new_from = source_range.from.div_euclid(pd);
    let new_to = source_range.to.div_euclid(pd);

    let overlap_from = final_from.max(new_from);
    let overlap_to = final_to.min(new_to);
    if overlap_from >= overlap_to {
        return None;
    }

    let dst_start = (overlap_from - final_from) as usize * ps;
    let dst_end = (overlap_to - final_from) as usize * ps;
    let src_start = (overlap_from - new_from) as usize * ps;

    if target.len() < dst_end {
        target.resize(dst_end, None);
    }
    for (offset, slot) in target[dst_start..dst_end].iter_mut().enumerate() {
        *slot = source.get(src_start + offset).copied().flatten();
    }

    let mut merged = TimeRange::new(overlap_from * pd, overlap_to * pd);
    if merged.from == source_range.from && merged.from > source_requested_from {
        target.drain(..dst_start.min(target.len()));
        target_range.from = merged.from;
        merged.from = target_requested_from;
    }
    Some(merged)
}

/// Remove `subtract` from every range, yielding zero, one, or two pieces per input.
pub fn difference(ranges: &[TimeRange], subtract: TimeRange) -> Vec<TimeRange> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for range in ranges {
        if subtract.from > range.to || subtract.to < range.from {
            out.push(*range);
            continue;
        }
        if subtract.from > range.from {
            out.push(TimeRange::new(range.from, subtract.from));
        }
        if subtract.to < range.to {
            out.push(TimeRange::new(subtract.to, range.to));
        }
    }
    out
}

/// Overlap of two ranges (`max` of the starts, `min` of the ends).
///
/// Used to seed a partition buffer from the first chunk that reaches it, so the
/// buffer never extends past its calendar bucket.
pub fn union(a: TimeRange, b: TimeRange) -> Option<TimeRange> {
    let range = TimeRange::new(a.from.max(b.from), a.to.min(b.to));
    (!range.is_empty()).then_some(range)
}

/// Ranges wanted by one contributor, grouped under an aggregable key.
#[derive(Debug, Clone)]
pub struct KeyedRanges<I> {
    pub key: String,
    pub ranges: Vec<TimeRange>,
    pub item: I,
}

/// One coalesced range and every contributor it satisfies.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRange<I> {
    pub key: String,
    pub range: TimeRange,
    pub items: Vec<I>,
}

/// Sweep-merge touching or overlapping ranges per key.
///
/// Output ranges of one key are sorted, pairwise disjoint and non-adjacent.
/// Contributors appear once per output range, in input order.
pub fn aggregate_ranges<I: Clone>(inputs: &[KeyedRanges<I>]) -> Vec<AggregatedRange<I>> {
    let mut by_key: BTreeMap<&str, Vec<(TimeRange, usize)>> = BTreeMap::new();
    for (idx, input) in inputs.iter().enumerate() {
        by_key.entry(input.key.as_str()).or_default().extend(
            input
                .ranges
                .iter()
                .filter(|r| !r.is_empty())
                .map(|r| (*r, idx)),
        );
    }

    let mut out = Vec::new();
    for (key, mut spans) in by_key {
        spans.sort_by_key(|(range, idx)| (range.from, *idx));

        let mut current: Option<(TimeRange, Vec<usize>)> = None;
        for (range, idx) in spans {
            match current.as_mut() {
                Some((acc, members)) if range.from <= acc.to => {
                    acc.to = acc.to.max(range.to);
                    if !members.contains(&idx) {
                        members.push(idx);
                    }
                }
                _ => {
                    if let Some(done) = current.take() {
                        out.push(finish(key, done, inputs));
                    }
                    current = Some((range, vec![idx]));
                }
            }
        }
        if let Some(done) = current {
            out.push(finish(key, done, inputs));
        }
    }
    out
}

fn finish<I: Clone>(
    key: &str,
    (range, mut members): (TimeRange, Vec<usize>),
    inputs: &[KeyedRanges<I>],
) -> AggregatedRange<I> {
    members.sort_unstable();
    AggregatedRange {
        key: key.to_string(),
        range,
        items: members.into_iter().map(|i| inputs[i].item.clone()).collect(),
    }
}
