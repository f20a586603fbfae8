use std::fmt;

use crate::api::Params;

/// Canonical identity of a logical request: endpoint path plus its sorted,
/// url-encoded query string.
///
/// Two requests with the same endpoint and the same parameter pairs share a
/// signature no matter how or when they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
  pub fn new(endpoint: &str, params: &Params) -> Self {
    let endpoint = endpoint.trim();
    if params.is_empty() {
      Self(endpoint.to_string())
    } else {
      Self(format!("{}?{}", endpoint, params.to_query_string()))
    }
  }
}

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
