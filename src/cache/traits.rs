//! Core traits and types for the caching system.

use serde_json::Value;
use std::future::Future;
use tokio::time::Instant;

use crate::api::{ApiClient, FetchError, Params};

/// Source of JSON payloads for the fetch service.
///
/// Implemented by [`ApiClient`] for real traffic; tests substitute in-memory
/// fakes. The returned future is dropped when the operation is aborted.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch_json(
    &self,
    endpoint: &str,
    params: &Params,
  ) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

impl Fetcher for ApiClient {
  fn fetch_json(
    &self,
    endpoint: &str,
    params: &Params,
  ) -> impl Future<Output = Result<Value, FetchError>> + Send {
    self.get_json(endpoint, params, None)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the payload was fetched from the backend
  pub fetched_at: Instant,
}

impl<T> CacheResult<T> {
  /// Data from a network request this caller started.
  pub fn from_network(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  /// Data from a network request another caller had already started.
  pub fn joined(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Joined,
      fetched_at,
    }
  }

  /// Data served from a fresh cache entry.
  pub fn from_cache(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      fetched_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from a request started by this caller
  Network,
  /// Shared outcome of a request that was already in flight
  Joined,
  /// Data from cache, still within the freshness window
  CacheFresh,
}
