//! Cached client that wraps ApiClient with the shared fetch service.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachePolicy, CacheResult, FetchService};

use super::client::ApiClient;
use super::endpoints;
use super::error::FetchError;
use super::params::Params;
use super::types::{AverageResponse, Forecast, Reading};

/// Backend client with transparent caching and de-duplication.
///
/// Same typed calls as [`ApiClient`], but served through a [`FetchService`]
/// so repeated calls inside the freshness window cost nothing.
#[derive(Clone)]
pub struct CachedClient {
  service: FetchService<ApiClient>,
}

impl CachedClient {
  pub fn new(client: ApiClient, policy: CachePolicy) -> Self {
    Self {
      service: FetchService::new(client, policy),
    }
  }

  /// The underlying service, for building queries that share this cache.
  pub fn service(&self) -> &FetchService<ApiClient> {
    &self.service
  }

  async fn load<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &Params,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<T>, FetchError> {
    let loaded = self.service.load(endpoint, params, cancel).await?;
    let data = T::deserialize(&*loaded.data)?;
    Ok(loaded.map(|_| data))
  }

  /// Downsampled readings for `variable` over the last `days` days.
  pub async fn readings(
    &self,
    variable: &str,
    days: u32,
    remove_outliers: bool,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<Vec<Reading>>, FetchError> {
    let (endpoint, params) = endpoints::readings(variable, days, remove_outliers);
    self.load(&endpoint, &params, cancel).await
  }

  /// Model forecast for `variable`.
  pub async fn forecast(
    &self,
    variable: &str,
    days: u32,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<Forecast>, FetchError> {
    let (endpoint, params) = endpoints::forecast(variable, days);
    self.load(&endpoint, &params, cancel).await
  }

  /// Mean of the last day's readings for `variable`, if the backend had any.
  pub async fn average(
    &self,
    variable: &str,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<Option<f64>>, FetchError> {
    let (endpoint, params) = endpoints::average(variable);
    let result: CacheResult<AverageResponse> = self.load(&endpoint, &params, cancel).await?;
    Ok(result.map(|response| response.get(variable).copied().flatten()))
  }

  /// Raw JSON for any endpoint.
  pub async fn raw(
    &self,
    endpoint: &str,
    params: &Params,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<Arc<serde_json::Value>>, FetchError> {
    self.service.load(endpoint, params, cancel).await
  }

  /// Abort outstanding requests and drop cached data.
  pub fn shutdown(&self) {
    self.service.shutdown();
  }
}
