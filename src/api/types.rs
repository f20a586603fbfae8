//! Serde types matching the sensor backend's JSON responses, plus the small
//! amount of domain knowledge the dashboard layers on top of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

// ============================================================================
// /api/data/<variable>
// ============================================================================

/// One downsampled sensor reading.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reading {
  #[serde(rename = "Timestamp", deserialize_with = "deserialize_timestamp")]
  pub timestamp: DateTime<Utc>,
  /// Empty resample buckets come back as null.
  #[serde(rename = "Value", default)]
  pub value: Option<f64>,
}

/// Accepts both RFC 3339 and the HTTP-date form Flask emits for datetimes.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  parse_timestamp(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", s)))
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .or_else(|_| DateTime::parse_from_rfc2822(s))
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
    .or_else(|| {
      chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.and_utc())
        .ok()
    })
}

/// Min / max / mean / latest over a reading series, ignoring null values.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
  pub count: usize,
  pub min: f64,
  pub max: f64,
  pub mean: f64,
  pub latest: Option<(DateTime<Utc>, f64)>,
}

impl SeriesSummary {
  pub fn from_readings(readings: &[Reading]) -> Option<Self> {
    let values: Vec<(DateTime<Utc>, f64)> = readings
      .iter()
      .filter_map(|r| r.value.filter(|v| v.is_finite()).map(|v| (r.timestamp, v)))
      .collect();

    if values.is_empty() {
      return None;
    }

    let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
    for (_, v) in &values {
      min = min.min(*v);
      max = max.max(*v);
      sum += v;
    }

    Some(Self {
      count: values.len(),
      min,
      max,
      mean: sum / values.len() as f64,
      latest: values.iter().max_by_key(|(ts, _)| *ts).copied(),
    })
  }
}

// ============================================================================
// /api/forecast/<variable>
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForecastPoint {
  #[serde(deserialize_with = "deserialize_timestamp")]
  pub ds: DateTime<Utc>,
  pub yhat: f64,
  pub yhat_lower: f64,
  pub yhat_upper: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Forecast {
  #[serde(default)]
  pub forecast: Vec<ForecastPoint>,
  /// Mean absolute error of the model on held-out data.
  pub mae: Option<f64>,
}

// ============================================================================
// /api/averages?variable=<v>
// ============================================================================

/// `{"<variable>": <mean>}`; the backend keys the result by the variable name.
pub type AverageResponse = HashMap<String, Option<f64>>;

// ============================================================================
// Variables and gauge scales
// ============================================================================

/// Variables the dashboard offers.
pub const VARIABLES: &[&str] = &[
  "PM2.5",
  "PM10",
  "NO2",
  "O3",
  "CO",
  "Temperature",
  "Humidity",
  "Pressure",
  "Wind Speed",
];

/// Timescales (in days) the dashboard offers.
pub const TIMESCALES: &[u32] = &[1, 3, 7, 30];

/// Gauge scale for a variable: full-scale value and the level at which it is
/// drawn as an alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeScale {
  pub max: f64,
  pub alert_at: f64,
}

impl GaugeScale {
  pub fn for_variable(variable: &str) -> Self {
    match variable {
      "PM2.5" => Self {
        max: 105.0,
        alert_at: 35.0,
      },
      "NO2" => Self {
        max: 75.0,
        alert_at: 25.0,
      },
      "PM10" => Self {
        max: 135.0,
        alert_at: 45.0,
      },
      _ => Self {
        max: 100.0,
        alert_at: 30.0,
      },
    }
  }

  pub fn is_alert(&self, value: f64) -> bool {
    value >= self.alert_at
  }
}
