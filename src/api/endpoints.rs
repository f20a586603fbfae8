//! Request descriptors for the backend's read endpoints.

use super::params::Params;

/// `/api/data/<variable>?days=<n>&remove_outliers=<bool>`
pub fn readings(variable: &str, days: u32, remove_outliers: bool) -> (String, Params) {
  (
    format!("/api/data/{}", variable),
    Params::new()
      .with("days", days)
      .with("remove_outliers", remove_outliers),
  )
}

/// `/api/forecast/<variable>?days=<n>`
pub fn forecast(variable: &str, days: u32) -> (String, Params) {
  (
    format!("/api/forecast/{}", variable),
    Params::new().with("days", days),
  )
}

/// `/api/averages?variable=<v>`
pub fn average(variable: &str) -> (String, Params) {
  (
    "/api/averages".to_string(),
    Params::new().with("variable", variable),
  )
}
