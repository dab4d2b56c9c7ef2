//! Per-request state carried through one batch.

use crate::interval::{align_to_grid, difference, merge_data, Grid};
use crate::promise::Settlement;
use crate::source::SeriesPlan;
use crate::types::{DataFormat, SeriesChunk, SeriesQuery, SeriesResult, TimeRange};

/// Result of merging a chunk into an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Merged,
    NoOverlap,
    FormatMismatch,
}

/// One caller request while its batch is being processed.
#[derive(Debug)]
pub(crate) struct FetchItem {
    pub query: SeriesQuery,
    pub plan: SeriesPlan,
    pub settlement: Settlement,
    pub data: Vec<Option<f64>>,
    /// Set by the first chunk merged in.
    pub format: Option<DataFormat>,
    /// Requested range aligned to the point grid. `from` may move forward
    /// when the source turns out to hold no earlier data.
    pub range: TimeRange,
    pub missing: Vec<TimeRange>,
    /// Whether the caller already saw the current partial data.
    pub is_notified: bool,
}

impl FetchItem {
    pub fn new(query: SeriesQuery, plan: SeriesPlan, settlement: Settlement) -> Self {
        let range = align_to_grid(query.range(), plan.point_duration);
        Self {
            query,
            plan,
            settlement,
            data: Vec::new(),
            format: None,
            range,
            missing: vec![range],
            is_notified: true,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }

    /// Copy a chunk's overlap into this item and shrink its missing ranges.
    pub fn merge(&mut self, chunk: &SeriesChunk, requested_from: i64) -> MergeOutcome {
        let format = self.format.get_or_insert_with(|| chunk.format.clone());
        if *format != chunk.format {
            return MergeOutcome::FormatMismatch;
        }
        let grid = Grid::new(self.plan.point_duration, format.point_size());
        let target_from = self.range.from;

        match merge_data(
            &mut self.data,
            &mut self.range,
            &chunk.data,
            chunk.range,
            grid,
            requested_from,
            target_from,
        ) {
            Some(merged) => {
                self.missing = difference(&self.missing, merged);
                MergeOutcome::Merged
            }
            None => MergeOutcome::NoOverlap,
        }
    }

    /// Complete, or on the final pass only missing a tail the server never had.
    pub fn is_resolvable(&self, final_pass: bool) -> bool {
        self.missing.is_empty()
            || (final_pass && self.missing.iter().all(|r| r.to == self.range.to))
    }

    pub fn result(&self) -> SeriesResult {
        SeriesResult {
            data: self.data.clone(),
            data_format: self.format.clone().unwrap_or_default(),
            from: self.range.start(),
            point_duration_ms: self.plan.point_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::PartitionUnit;
    use chrono::{TimeZone, Utc};

    const MIN: i64 = 60_000;
    const JAN1: i64 = 1_577_836_800_000;

    fn item(minutes: i64) -> FetchItem {
        let from = Utc.timestamp_millis_opt(JAN1).unwrap();
        let to = Utc.timestamp_millis_opt(JAN1 + minutes * MIN).unwrap();
        let (settlement, _rx) = Settlement::channel();
        FetchItem::new(
            SeriesQuery::aggregation(1, from, to, "Base.MinuteSet"),
            SeriesPlan {
                view: Some("Base.MinuteSet".into()),
                point_duration: MIN,
                partition: PartitionUnit::Day,
                cache_key_base: "plantyst.MTSA.1.V.B.MinS.".into(),
            },
            settlement,
        )
    }

    fn chunk(from_min: i64, to_min: i64, format: DataFormat) -> SeriesChunk {
        let size = format.point_size() as i64;
        SeriesChunk {
            data: (0..(to_min - from_min) * size).map(|v| Some(v as f64)).collect(),
            format,
            range: TimeRange::new(JAN1 + from_min * MIN, JAN1 + to_min * MIN),
        }
    }

    fn covered_plus_missing(item: &FetchItem, covered: &[TimeRange]) -> Vec<TimeRange> {
        let mut all: Vec<TimeRange> = covered.iter().chain(item.missing.iter()).copied().collect();
        all.sort_by_key(|r| r.from);
        let mut merged: Vec<TimeRange> = Vec::new();
        for r in all {
            match merged.last_mut() {
                Some(last) if r.from <= last.to => last.to = last.to.max(r.to),
                _ => merged.push(r),
            }
        }
        merged
    }

    #[test]
    fn test_coverage_is_preserved() {
        let mut item = item(60);
        let full = item.range;
        let mut covered = Vec::new();
        for (from, to) in [(0, 10), (20, 30), (5, 25)] {
            let c = chunk(from, to, DataFormat::Scalar);
            assert_eq!(item.merge(&c, c.range.from), MergeOutcome::Merged);
            covered.push(c.range);
            assert_eq!(covered_plus_missing(&item, &covered), vec![full]);
        }
        assert_eq!(item.missing, vec![TimeRange::new(JAN1 + 30 * MIN, JAN1 + 60 * MIN)]);
    }

    #[test]
    fn test_format_mismatch() {
        let mut item = item(10);
        let fields = DataFormat::Fields(vec!["ValueSum".into(), "ItemCount".into()]);
        assert_eq!(item.merge(&chunk(0, 5, fields), JAN1), MergeOutcome::Merged);
        assert_eq!(
            item.merge(&chunk(5, 10, DataFormat::Scalar), JAN1 + 5 * MIN),
            MergeOutcome::FormatMismatch
        );
    }

    #[test]
    fn test_no_overlap() {
        let mut item = item(10);
        let c = chunk(10, 20, DataFormat::Scalar);
        assert_eq!(item.merge(&c, c.range.from), MergeOutcome::NoOverlap);
        assert_eq!(item.missing.len(), 1);
    }

    #[test]
    fn test_final_pass_accepts_missing_tail_only() {
        let mut item = item(10);
        let head = chunk(0, 6, DataFormat::Scalar);
        item.merge(&head, JAN1);
        assert!(!item.is_resolvable(false));
        assert!(item.is_resolvable(true));

        let mut gap = self::item(10);
        let tail = chunk(4, 10, DataFormat::Scalar);
        gap.merge(&tail, JAN1 + 4 * MIN);
        assert!(!gap.is_resolvable(true));
    }

    #[test]
    fn test_late_start_rebases_result() {
        let mut item = item(10);
        let late = chunk(3, 10, DataFormat::Scalar);
        // Asked the server from minute 0, data only starts at minute 3.
        assert_eq!(item.merge(&late, JAN1), MergeOutcome::Merged);
        assert!(item.missing.is_empty());
        let result = item.result();
        assert_eq!(result.from.timestamp_millis(), JAN1 + 3 * MIN);
        assert_eq!(result.data.len(), 7);
    }
}
