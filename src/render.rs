//! Plain-text presentation of backend payloads.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::api::types::{Forecast, GaugeScale, Reading, SeriesSummary};
use crate::api::FetchError;
use crate::cache::CacheSource;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

fn timestamp(ts: &DateTime<Utc>) -> String {
  ts.format("%Y-%m-%d %H:%M").to_string()
}

pub fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::Joined => "shared",
    CacheSource::CacheFresh => "cache",
  }
}

pub fn summary_line(variable: &str, summary: Option<&SeriesSummary>) -> String {
  match summary {
    Some(s) => {
      let latest = s
        .latest
        .map(|(ts, v)| format!(", latest {:.2} at {}", v, timestamp(&ts)))
        .unwrap_or_default();
      format!(
        "{}: {} readings, min {:.2}, mean {:.2}, max {:.2}{}",
        variable, s.count, s.min, s.mean, s.max, latest
      )
    }
    None => format!("{}: no readings", variable),
  }
}

/// The last `limit` readings, oldest first.
pub fn readings_table(readings: &[Reading], limit: usize) -> String {
  let skip = readings.len().saturating_sub(limit);
  let mut out = String::new();
  for reading in readings.iter().skip(skip) {
    let value = reading
      .value
      .map(|v| format!("{:>10.2}", v))
      .unwrap_or_else(|| format!("{:>10}", "-"));
    let _ = writeln!(out, "{}  {}", timestamp(&reading.timestamp), value);
  }
  out
}

/// `[#####---------------]  12.30 / 105 (alert at 35)`
pub fn gauge(variable: &str, value: f64, width: usize) -> String {
  let scale = GaugeScale::for_variable(variable);
  let ratio = (value / scale.max).clamp(0.0, 1.0);
  let filled = (ratio * width as f64).round() as usize;
  let marker = if scale.is_alert(value) { "  ALERT" } else { "" };

  format!(
    "{:<12} [{}{}] {:>7.2} / {} (alert at {}){}",
    truncate(variable, 12),
    "#".repeat(filled),
    "-".repeat(width - filled),
    value,
    scale.max,
    scale.alert_at,
    marker
  )
}

pub fn forecast_table(forecast: &Forecast, limit: usize) -> String {
  let mut out = String::new();
  if let Some(mae) = forecast.mae {
    let _ = writeln!(out, "MAE {:.3}", mae);
  }
  for point in forecast.forecast.iter().take(limit) {
    let _ = writeln!(
      out,
      "{}  {:>9.2}  [{:.2} .. {:.2}]",
      timestamp(&point.ds),
      point.yhat,
      point.yhat_lower,
      point.yhat_upper
    );
  }
  out
}

/// Status line for a watched query after it settles.
pub fn watch_line(
  variable: &str,
  readings: Option<&[Reading]>,
  error: Option<&FetchError>,
  source: Option<CacheSource>,
  now: DateTime<Utc>,
) -> String {
  let summary = readings.and_then(SeriesSummary::from_readings);
  let mut line = format!(
    "[{}] {}",
    now.format("%H:%M:%S"),
    summary_line(variable, summary.as_ref())
  );
  if let Some(source) = source {
    let _ = write!(line, " ({})", source_label(source));
  }
  if let Some(error) = error {
    let _ = write!(line, " - refresh failed: {}", error);
  }
  line
}
