//! Errors produced while talking to the backend.

use thiserror::Error;

/// Failure of a single backend request.
///
/// `Clone` because one outcome is handed to every caller that joined a
/// de-duplicated request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Transport failure: DNS, connect, TLS, reset.
  #[error("network error: {0}")]
  Network(String),

  /// Backend answered with a non-2xx status.
  #[error("request failed with status {status}: {body}")]
  RequestFailed { status: u16, body: String },

  /// Body was not the JSON we expected.
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// Endpoint could not be joined onto the backend base URL.
  #[error("invalid request url: {0}")]
  InvalidUrl(String),

  /// The request was cancelled before it settled.
  #[error("request aborted")]
  Aborted,
}

impl FetchError {
  /// Cancellation is never shown to the user.
  pub fn is_abort(&self) -> bool {
    matches!(self, FetchError::Aborted)
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      FetchError::Decode(e.to_string())
    } else {
      FetchError::Network(e.to_string())
    }
  }
}

impl From<serde_json::Error> for FetchError {
  fn from(e: serde_json::Error) -> Self {
    FetchError::Decode(e.to_string())
  }
}
