//! Aggregation views and the calendar buckets their cache partitions use.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};

use crate::types::{millis_to_datetime, TimeRange};

pub const MINUTE_SET: &str = "Base.MinuteSet";
pub const HOUR: &str = "Base.Hour";
pub const DAY: &str = "Base.Day";

const DAY_MS: i64 = 86_400_000;

/// Calendar unit one cache partition spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionUnit {
    Day,
    Month,
    Year,
}

impl PartitionUnit {
    /// `chrono` format of a bucket's start, appended to the cache key base.
    pub fn key_format(&self) -> &'static str {
        match self {
            PartitionUnit::Day => "%Y%m%d",
            PartitionUnit::Month => "%Y%m",
            PartitionUnit::Year => "%Y",
        }
    }

    /// Start of the bucket containing `ms`.
    pub fn floor(&self, ms: i64) -> i64 {
        let date = millis_to_datetime(ms).date_naive();
        let start = match self {
            PartitionUnit::Day => Some(date),
            PartitionUnit::Month => date.with_day(1),
            PartitionUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        };
        start
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(ms - ms.rem_euclid(DAY_MS))
    }

    /// Start of the bucket following the one containing `ms`.
    pub fn next(&self, ms: i64) -> i64 {
        let start = self.floor(ms);
        let date = millis_to_datetime(start).date_naive();
        let next = match self {
            PartitionUnit::Day => date.succ_opt(),
            PartitionUnit::Month => date.checked_add_months(Months::new(1)),
            PartitionUnit::Year => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
        };
        next.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(start + DAY_MS)
    }

    /// Full calendar buckets intersecting `range`.
    pub fn split(&self, range: TimeRange) -> Vec<TimeRange> {
        let mut buckets = Vec::new();
        let mut start = self.floor(range.from);
        while start < range.to {
            let end = self.next(start);
            buckets.push(TimeRange::new(start, end));
            start = end;
        }
        buckets
    }

    /// Key suffix for the bucket starting at `ms`.
    pub fn format(&self, ms: i64) -> String {
        let start: DateTime<Utc> = millis_to_datetime(ms);
        start.format(self.key_format()).to_string()
    }
}

/// An aggregation resolution of a measurement series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub id: String,
    pub point_duration_ms: i64,
    /// Short name used inside cache keys.
    pub cache_key_name: String,
    pub partition: PartitionUnit,
}

impl View {
    pub fn new(
        id: impl Into<String>,
        point_duration_ms: i64,
        cache_key_name: impl Into<String>,
        partition: PartitionUnit,
    ) -> Self {
        Self {
            id: id.into(),
            point_duration_ms,
            cache_key_name: cache_key_name.into(),
            partition,
        }
    }
}

/// The fixed set of views a source understands.
#[derive(Debug, Clone)]
pub struct ViewCatalog {
    views: HashMap<String, View>,
}

impl Default for ViewCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl ViewCatalog {
    /// Minute-set, hourly, and daily aggregation views.
    pub fn standard() -> Self {
        Self::from_views([
            View::new(MINUTE_SET, 60_000, "V.B.MinS", PartitionUnit::Day),
            View::new(HOUR, 3_600_000, "V.B.H", PartitionUnit::Month),
            View::new(DAY, DAY_MS, "V.B.D", PartitionUnit::Year),
        ])
    }

    pub fn from_views(views: impl IntoIterator<Item = View>) -> Self {
        Self {
            views: views.into_iter().map(|v| (v.id.clone(), v)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&View> {
        self.views.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.views.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(y: i32, mo: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_floor_and_next() {
        let t = ms(2020, 2, 29, 13);
        assert_eq!(PartitionUnit::Day.floor(t), ms(2020, 2, 29, 0));
        assert_eq!(PartitionUnit::Day.next(t), ms(2020, 3, 1, 0));
        assert_eq!(PartitionUnit::Month.floor(t), ms(2020, 2, 1, 0));
        assert_eq!(PartitionUnit::Month.next(t), ms(2020, 3, 1, 0));
        assert_eq!(PartitionUnit::Year.floor(t), ms(2020, 1, 1, 0));
        assert_eq!(PartitionUnit::Year.next(t), ms(2021, 1, 1, 0));
    }

    #[test]
    fn test_split_across_midnight() {
        let range = TimeRange::new(ms(2020, 1, 1, 22), ms(2020, 1, 2, 2));
        let buckets = PartitionUnit::Day.split(range);
        assert_eq!(
            buckets,
            vec![
                TimeRange::new(ms(2020, 1, 1, 0), ms(2020, 1, 2, 0)),
                TimeRange::new(ms(2020, 1, 2, 0), ms(2020, 1, 3, 0)),
            ]
        );
    }

    #[test]
    fn test_split_ending_on_boundary() {
        let range = TimeRange::new(ms(2020, 1, 1, 0), ms(2020, 1, 2, 0));
        assert_eq!(PartitionUnit::Day.split(range).len(), 1);
    }

    #[test]
    fn test_key_formats() {
        let t = ms(2020, 3, 7, 0);
        assert_eq!(PartitionUnit::Day.format(t), "20200307");
        assert_eq!(PartitionUnit::Month.format(t), "202003");
        assert_eq!(PartitionUnit::Year.format(t), "2020");
    }

    #[test]
    fn test_standard_catalog() {
        let catalog = ViewCatalog::standard();
        let minute = catalog.get(MINUTE_SET).unwrap();
        assert_eq!(minute.point_duration_ms, 60_000);
        assert_eq!(minute.cache_key_name, "V.B.MinS");
        assert_eq!(catalog.get(HOUR).unwrap().partition, PartitionUnit::Month);
        assert_eq!(catalog.get(DAY).unwrap().partition, PartitionUnit::Year);
        assert!(catalog.get("Base.Week").is_none());
    }
}
