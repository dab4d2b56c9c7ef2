//! Core data types for measurement queries, fetched series, and fetch errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rejection reason delivered when a caller cancels a pending fetch.
pub const CANCELLED_BY_USER: &str = "Canceled by user.";

/// Identifier of one `fetch` call, used for cancellation lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Half-open `[from, to)` interval of UTC epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

impl TimeRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// Build a range from two instants.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: from.timestamp_millis(),
            to: to.timestamp_millis(),
        }
    }

    /// Zero-length (or inverted) ranges carry no data.
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn duration_ms(&self) -> i64 {
        self.to - self.from
    }

    pub fn start(&self) -> DateTime<Utc> {
        millis_to_datetime(self.from)
    }

    pub fn end(&self) -> DateTime<Utc> {
        millis_to_datetime(self.to)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start().format("%Y-%m-%dT%H:%M:%SZ"),
            self.end().format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Convert epoch milliseconds to a UTC instant. Out-of-range values clamp to the epoch.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Field layout of one data point.
///
/// On the wire an absent `outputFormat` means a single scalar per point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<Vec<String>>", into = "Option<Vec<String>>")]
pub enum DataFormat {
    #[default]
    Scalar,
    Fields(Vec<String>),
}

impl DataFormat {
    /// Number of values stored per point.
    pub fn point_size(&self) -> usize {
        match self {
            DataFormat::Scalar => 1,
            DataFormat::Fields(fields) => fields.len().max(1),
        }
    }

    /// Position of a named field inside a point.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            DataFormat::Scalar => None,
            DataFormat::Fields(fields) => fields.iter().position(|f| f == name),
        }
    }

    pub fn fields(&self) -> &[String] {
        match self {
            DataFormat::Scalar => &[],
            DataFormat::Fields(fields) => fields,
        }
    }
}

impl From<Option<Vec<String>>> for DataFormat {
    fn from(value: Option<Vec<String>>) -> Self {
        match value {
            Some(fields) if !fields.is_empty() => DataFormat::Fields(fields),
            _ => DataFormat::Scalar,
        }
    }
}

impl From<DataFormat> for Option<Vec<String>> {
    fn from(value: DataFormat) -> Self {
        match value {
            DataFormat::Scalar => None,
            DataFormat::Fields(fields) => Some(fields),
        }
    }
}

/// A caller's request for one measurement series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub measurement_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Aggregation view id (e.g. `Base.MinuteSet`). Daily state-sum sources ignore it.
    pub view: Option<String>,
}

impl SeriesQuery {
    /// Query an aggregated series at the given view resolution.
    pub fn aggregation(
        measurement_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        view: impl Into<String>,
    ) -> Self {
        Self {
            measurement_id,
            from,
            to,
            view: Some(view.into()),
        }
    }

    /// Query a daily series (state sums).
    pub fn daily(measurement_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            measurement_id,
            from,
            to,
            view: None,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::between(self.from, self.to)
    }
}

/// Data delivered to a caller, either as progress or as the final result.
///
/// Point `i` covers `[from + i * point_duration, from + (i + 1) * point_duration)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesResult {
    /// Flattened point values, `data_format.point_size()` entries per point.
    pub data: Vec<Option<f64>>,
    pub data_format: DataFormat,
    pub from: DateTime<Utc>,
    pub point_duration_ms: i64,
}

/// One point of a [`SeriesResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint<'a> {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub fields: &'a [Option<f64>],
}

impl SeriesResult {
    pub fn point_count(&self) -> usize {
        self.data.len() / self.data_format.point_size()
    }

    /// Iterate points with their reconstructed time bounds.
    pub fn points(&self) -> impl Iterator<Item = SeriesPoint<'_>> + '_ {
        let start = self.from.timestamp_millis();
        let step = self.point_duration_ms;
        self.data
            .chunks_exact(self.data_format.point_size())
            .enumerate()
            .map(move |(i, fields)| {
                let from = start + i as i64 * step;
                SeriesPoint {
                    from: millis_to_datetime(from),
                    to: millis_to_datetime(from + step),
                    fields,
                }
            })
    }

    /// Every point's value of one named field.
    pub fn field_values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.data_format.field_index(name)?;
        Some(
            self.data
                .chunks_exact(self.data_format.point_size())
                .map(|point| point[idx])
                .collect(),
        )
    }

    /// One value per point.
    ///
    /// Scalar data is returned as-is. Multi-field data yields `ValueSum / ItemCount`
    /// when both fields exist, `ValueSum` when only it exists, and the first field
    /// otherwise.
    pub fn values(&self) -> Vec<Option<f64>> {
        let size = self.data_format.point_size();
        if size <= 1 {
            return self.data.clone();
        }

        let sum_idx = self.data_format.field_index("ValueSum");
        let count_idx = self.data_format.field_index("ItemCount");

        self.data
            .chunks_exact(size)
            .map(|point| match (sum_idx, count_idx) {
                (Some(s), Some(c)) => match (point[s], point[c]) {
                    (Some(sum), Some(count)) if count != 0.0 => Some(sum / count),
                    _ => None,
                },
                (Some(s), None) => point[s],
                _ => point[0],
            })
            .collect()
    }
}

/// A contiguous run of points from the cache or the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeriesChunk {
    pub data: Vec<Option<f64>>,
    pub format: DataFormat,
    pub range: TimeRange,
}

/// Reasons a fetch can fail. Delivered through the caller's handle.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Invalid query: To ({to}) is not after From ({from})")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("Unknown view: {0}")]
    UnknownView(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    #[error("failed to fetch data")]
    IncompleteData,

    #[error("Got incompatible parts of data.")]
    DataFormatMismatch,

    #[error("Server did not return requested data.")]
    MissingResult,

    #[error("{0}")]
    Cancelled(String),
}

impl FetchError {
    pub fn cancelled_by_user() -> Self {
        FetchError::Cancelled(CANCELLED_BY_USER.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled(_))
    }
}

/// Convenience result type.
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_data_format_wire_mapping() {
        let scalar: DataFormat = serde_json::from_str("null").unwrap();
        assert_eq!(scalar, DataFormat::Scalar);
        assert_eq!(scalar.point_size(), 1);

        let fields: DataFormat = serde_json::from_str(r#"["ValueSum","ItemCount"]"#).unwrap();
        assert_eq!(fields.point_size(), 2);
        assert_eq!(fields.field_index("ItemCount"), Some(1));
        assert_eq!(serde_json::to_string(&fields).unwrap(), r#"["ValueSum","ItemCount"]"#);

        let empty: DataFormat = serde_json::from_str("[]").unwrap();
        assert_eq!(empty, DataFormat::Scalar);
    }

    #[test]
    fn test_values_sum_over_count() {
        let result = SeriesResult {
            data: vec![Some(10.0), Some(2.0), None, Some(3.0), Some(6.0), Some(0.0)],
            data_format: DataFormat::Fields(vec!["ValueSum".into(), "ItemCount".into()]),
            from: at(0, 0),
            point_duration_ms: 60_000,
        };
        assert_eq!(result.point_count(), 3);
        assert_eq!(result.values(), vec![Some(5.0), None, None]);
    }

    #[test]
    fn test_values_value_sum_only() {
        let result = SeriesResult {
            data: vec![Some(1.0), Some(7.0), Some(2.0), Some(8.0)],
            data_format: DataFormat::Fields(vec!["Other".into(), "ValueSum".into()]),
            from: at(0, 0),
            point_duration_ms: 60_000,
        };
        assert_eq!(result.values(), vec![Some(7.0), Some(8.0)]);
        assert_eq!(result.field_values("Other"), Some(vec![Some(1.0), Some(2.0)]));
        assert_eq!(result.field_values("Missing"), None);
    }

    #[test]
    fn test_points_reconstruct_time() {
        let result = SeriesResult {
            data: vec![Some(1.0), Some(2.0)],
            data_format: DataFormat::Scalar,
            from: at(0, 0),
            point_duration_ms: 60_000,
        };
        let points: Vec<_> = result.points().collect();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].from, at(0, 1));
        assert_eq!(points[1].to, at(0, 2));
        assert_eq!(points[1].fields, &[Some(2.0)]);
    }

    #[test]
    fn test_time_range_display() {
        let range = TimeRange::between(at(0, 0), at(1, 0));
        assert_eq!(range.to_string(), "[2020-01-01T00:00:00Z, 2020-01-01T01:00:00Z)");
        assert!(!range.is_empty());
        assert!(TimeRange::new(5, 5).is_empty());
    }

    #[test]
    fn test_cancelled_error() {
        let err = FetchError::cancelled_by_user();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), CANCELLED_BY_USER);
        assert_eq!(FetchError::IncompleteData.to_string(), "failed to fetch data");
    }
}
