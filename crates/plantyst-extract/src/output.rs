//! CSV tables and their load manifests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use plantyst::wire::format_time;
use plantyst::SeriesResult;
use serde::Serialize;

use crate::ExtractError;

/// One output row per series point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Row {
    pub measurement_id: i64,
    pub from: String,
    pub to: String,
    pub value: Option<f64>,
}

impl Row {
    pub fn new(measurement_id: i64, from: DateTime<Utc>, to: DateTime<Utc>, value: Option<f64>) -> Self {
        Self {
            measurement_id,
            from: format_time(from.timestamp_millis()),
            to: format_time(to.timestamp_millis()),
            value,
        }
    }
}

/// Output file name of one measurement.
pub fn table_name(measurement_id: i64) -> String {
    format!("measurement-{measurement_id}.csv")
}

/// Flatten a fetched series, taking the `ValueSum` field when there is one.
pub fn rows(measurement_id: i64, result: &SeriesResult) -> Vec<Row> {
    let values = result
        .field_values("ValueSum")
        .unwrap_or_else(|| result.values());
    result
        .points()
        .zip(values)
        .map(|(point, value)| Row::new(measurement_id, point.from, point.to, value))
        .collect()
}

/// Write `rows` to `<dir>/<file_name>`. Nothing is written for an empty table.
pub fn write_csv(dir: &Path, file_name: &str, rows: &[Row]) -> Result<Option<PathBuf>, ExtractError> {
    if rows.is_empty() {
        tracing::warn!("{file_name} - Empty data.");
        return Ok(None);
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    let mut writer = csv::Writer::from_path(&path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    tracing::info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(Some(path))
}

/// Write an incremental-load manifest beside every CSV in `dir`.
pub fn generate_manifests(dir: &Path) -> Result<usize, ExtractError> {
    if !dir.exists() {
        return Ok(0);
    }
    let manifest = serde_json::to_string(&serde_json::json!({ "incremental": true }))?;

    let mut written = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let mut name = path.as_os_str().to_owned();
        name.push(".manifest");
        std::fs::write(PathBuf::from(name), &manifest)?;
        written += 1;
    }
    Ok(written)
}
