//! Configuration loading and resolution.
//!
//! The extractor reads `<data-dir>/config.json`; everything it needs lives
//! under the `parameters` key:
//!
//! ```json
//! {"parameters": {
//!     "apiURI": "https://portal.plantyst.com/api/",
//!     "#apiToken": "...",
//!     "measurementId": 1268,
//!     "granularity": "Base.MinuteSet",
//!     "changedInLast": {"amount": 1, "unitOfTime": "days"}
//! }}
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use plantyst::FileStore;
use serde::Deserialize;
use serde_json::{json, Value};

pub const CONFIG_FILE: &str = "config.json";
pub const OUTPUT_FILES_DIR: &str = "out/tables";
pub const DATA_GRANULARITY_DEFAULT: &str = "Base.MinuteSet";
pub const API_ENDPOINT_DEFAULT: &str = "MeasurementTimeSeriesAggregationsQuery";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Problem in the input configuration - {0}")]
    Invalid(String),

    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

/// Resolve the data directory: explicit argument, then `PLANTYST_DATA_DIR`,
/// then the current directory.
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(env_path) = std::env::var("PLANTYST_DATA_DIR") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    PathBuf::from(".")
}

/// Calendar unit of the `changedInLast` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "M" is months, "m" is minutes.
        match s {
            "m" | "minute" | "minutes" => Ok(Self::Minutes),
            "h" | "hour" | "hours" => Ok(Self::Hours),
            "d" | "day" | "days" => Ok(Self::Days),
            "w" | "week" | "weeks" => Ok(Self::Weeks),
            "M" | "month" | "months" => Ok(Self::Months),
            "y" | "year" | "years" => Ok(Self::Years),
            other => Err(invalid(format!("Unknown unitOfTime '{other}'"))),
        }
    }
}

/// How far back the extraction window reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedInLast {
    pub amount: u32,
    pub unit: TimeUnit,
}

impl Default for ChangedInLast {
    fn default() -> Self {
        Self {
            amount: 1,
            unit: TimeUnit::Days,
        }
    }
}

impl ChangedInLast {
    /// Start of the window ending at `now`. `None` if it underflows.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let amount = i64::from(self.amount);
        match self.unit {
            TimeUnit::Minutes => now.checked_sub_signed(Duration::minutes(amount)),
            TimeUnit::Hours => now.checked_sub_signed(Duration::hours(amount)),
            TimeUnit::Days => now.checked_sub_signed(Duration::days(amount)),
            TimeUnit::Weeks => now.checked_sub_signed(Duration::weeks(amount)),
            TimeUnit::Months => now.checked_sub_months(Months::new(self.amount)),
            TimeUnit::Years => now.checked_sub_months(Months::new(self.amount.saturating_mul(12))),
        }
    }
}

/// `config.json` as written by the user.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    parameters: Option<RawParameters>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParameters {
    #[serde(rename = "apiURI")]
    api_uri: Option<String>,
    #[serde(rename = "#apiToken")]
    api_token: Option<String>,
    measurement_id: Option<Lenient<i64>>,
    endpoint: Option<String>,
    granularity: Option<String>,
    changed_in_last: Option<RawWindow>,
    cache_dir: Option<String>,
    persist_cache: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWindow {
    amount: Option<Lenient<u32>>,
    unit_of_time: Option<String>,
}

/// A number that may also arrive as a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Number(T),
    Text(String),
}

impl<T: FromStr> Lenient<T> {
    /// `Ok(None)` for a blank string.
    fn resolve(self, field: &str) -> Result<Option<T>, ConfigError> {
        match self {
            Lenient::Number(n) => Ok(Some(n)),
            Lenient::Text(s) if s.trim().is_empty() => Ok(None),
            Lenient::Text(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(format!("{field} is not an integer: {s}"))),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Parsed extractor parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub api_uri: String,
    pub api_token: String,
    pub measurement_id: i64,
    pub endpoint: String,
    pub granularity: String,
    pub changed_in_last: ChangedInLast,
    /// Persistent cache directory (`cacheDir`, or the default one when
    /// `persistCache` is set). Without one the cache lives in memory.
    pub cache_dir: Option<PathBuf>,
}

impl ExtractorConfig {
    /// Load `<data_dir>/config.json`. A missing file counts as an empty
    /// configuration.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        let root = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| invalid(format!("{CONFIG_FILE} is not valid JSON: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("No configuration at {}", path.display());
                Value::Null
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let mut config = Self::from_json(&root)?;
        config.cache_dir = config.cache_dir.map(|dir| data_dir.join(dir));
        Ok(config)
    }

    pub fn from_json(root: &Value) -> Result<Self, ConfigError> {
        let file: Option<ConfigFile> =
            serde_json::from_value(root.clone()).map_err(|e| invalid(e.to_string()))?;
        let params = file.and_then(|f| f.parameters).unwrap_or_default();

        let api_uri = non_empty(params.api_uri)
            .ok_or_else(|| invalid("Parameter apiURI is empty/not defined"))?;
        let api_token = non_empty(params.api_token)
            .ok_or_else(|| invalid("Parameter #apiToken is empty/not defined"))?;
        let endpoint =
            non_empty(params.endpoint).unwrap_or_else(|| API_ENDPOINT_DEFAULT.to_string());
        let granularity =
            non_empty(params.granularity).unwrap_or_else(|| DATA_GRANULARITY_DEFAULT.to_string());
        let measurement_id = match params.measurement_id {
            Some(id) => id.resolve("Field measurementId")?,
            None => None,
        }
        .ok_or_else(|| invalid("Field measurementId is empty/not defined"))?;

        let changed_in_last = match params.changed_in_last {
            Some(window) => window.resolve()?,
            None => ChangedInLast::default(),
        };
        let cache_dir = non_empty(params.cache_dir)
            .map(PathBuf::from)
            .or_else(|| params.persist_cache.unwrap_or(false).then(FileStore::default_dir));

        Ok(Self {
            api_uri,
            api_token,
            measurement_id,
            endpoint,
            granularity,
            changed_in_last,
            cache_dir,
        })
    }

    /// Resolved parameters with the token masked, for display.
    pub fn redacted(&self) -> Value {
        json!({
            "apiURI": self.api_uri,
            "#apiToken": "***",
            "measurementId": self.measurement_id,
            "endpoint": self.endpoint,
            "granularity": self.granularity,
            "changedInLast": {
                "amount": self.changed_in_last.amount,
                "unitOfTime": format!("{:?}", self.changed_in_last.unit).to_lowercase(),
            },
            "cacheDir": self.cache_dir.as_ref().map(|p| p.display().to_string()),
        })
    }
}

impl RawWindow {
    fn resolve(self) -> Result<ChangedInLast, ConfigError> {
        let defaults = ChangedInLast::default();
        let amount = match self.amount {
            Some(amount) => amount.resolve("Parameter changedInLast.amount")?,
            None => None,
        };
        let unit = match self.unit_of_time {
            Some(unit) => unit.parse()?,
            None => defaults.unit,
        };
        Ok(ChangedInLast {
            amount: amount.unwrap_or(defaults.amount),
            unit,
        })
    }
}
