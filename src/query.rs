//! Per-consumer query over the fetch service.
//!
//! Inspired by TanStack Query, a `Query<T>` owns one consumer's view of an
//! endpoint: the latest data, whether a load is under way, and the last
//! error. Loads go through the shared [`FetchService`], so fresh cache entries
//! and requests already in flight are reused.
//!
//! # Example
//!
//! ```ignore
//! let mut query: Query<Vec<Reading>> =
//!     Query::new(service.clone(), "/api/data/PM2.5", Params::new().with("days", 1));
//!
//! query.fetch();
//!
//! loop {
//!     query.changed().await;
//!     let view = query.view();
//!     if let Some(readings) = view.data {
//!         render(readings);
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{ApiClient, FetchError, Params};
use crate::cache::{CacheResult, CacheSource, FetchService, Fetcher};

/// Default wait before a trigger actually reaches the service.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Where the query is in its load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Nothing requested yet, or the last load was aborted
  Idle,
  /// Triggered, waiting out the debounce window
  Pending,
  /// Waiting on the fetch service
  InFlight,
  /// Last load finished, successfully or not
  Settled,
}

/// Read-only projection handed to renderers.
#[derive(Debug)]
pub struct QueryView<'a, T> {
  pub data: Option<&'a Arc<T>>,
  pub loading: bool,
  pub error: Option<&'a FetchError>,
}

enum Message {
  Started(u64),
  Settled(u64, Result<CacheResult<Arc<Value>>, FetchError>),
}

/// One consumer's subscription to `(endpoint, params)`.
///
/// Triggers (first fetch, parameter change, refresh tick) are debounced:
/// each one cancels the previous, so only the last trigger in a burst reaches
/// the service. Dropping the query cancels whatever it started; requests
/// shared with other consumers continue for them.
pub struct Query<T, F: Fetcher = ApiClient> {
  service: FetchService<F>,
  endpoint: String,
  params: Params,
  debounce: Duration,
  refresh_interval: Duration,

  phase: Phase,
  data: Option<Arc<T>>,
  payload: Option<Arc<Value>>,
  error: Option<FetchError>,
  source: Option<CacheSource>,
  next_refresh: Option<Instant>,

  trigger: u64,
  cancel: Option<CancellationToken>,
  tx: mpsc::UnboundedSender<Message>,
  rx: mpsc::UnboundedReceiver<Message>,
}

impl<T, F> Query<T, F>
where
  T: DeserializeOwned + Send + Sync + 'static,
  F: Fetcher,
{
  /// Create an idle query. The refresh interval defaults to the service's
  /// freshness window.
  pub fn new(service: FetchService<F>, endpoint: impl Into<String>, params: Params) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let refresh_interval = service.freshness();

    Self {
      service,
      endpoint: endpoint.into(),
      params,
      debounce: DEFAULT_DEBOUNCE,
      refresh_interval,
      phase: Phase::Idle,
      data: None,
      payload: None,
      error: None,
      source: None,
      next_refresh: None,
      trigger: 0,
      cancel: None,
      tx,
      rx,
    }
  }

  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  /// Re-trigger this long after each settle. `Duration::ZERO` disables it.
  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  #[cfg(test)]
  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// Where the last successful payload came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn view(&self) -> QueryView<'_, T> {
    QueryView {
      data: self.data.as_ref(),
      loading: self.is_loading(),
      error: self.error.as_ref(),
    }
  }

  #[cfg(test)]
  pub fn data(&self) -> Option<&Arc<T>> {
    self.data.as_ref()
  }

  #[cfg(test)]
  pub fn error(&self) -> Option<&FetchError> {
    self.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    matches!(self.phase, Phase::Pending | Phase::InFlight)
  }

  /// Start loading unless a load is already under way.
  pub fn fetch(&mut self) {
    if self.is_loading() {
      return;
    }
    self.start();
  }

  /// Trigger a load even if one is under way; the earlier one is cancelled.
  pub fn refetch(&mut self) {
    self.start();
  }

  /// Switch to new parameters. Cancels any load for the old ones.
  // Interactive consumers only; the CLI fixes its parameters up front.
  #[allow(dead_code)]
  pub fn set_params(&mut self, params: Params) {
    if params == self.params && self.phase != Phase::Idle {
      return;
    }
    self.params = params;
    self.start();
  }

  /// Apply finished work and fire a due refresh without blocking.
  ///
  /// Returns `true` if the state changed. Call this from an event loop tick.
  // Tick-driven consumers only; the CLI awaits `changed()` instead.
  #[allow(dead_code)]
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if self.refresh_due(Instant::now()) {
      self.refetch();
      changed = true;
    }

    while let Ok(message) = self.rx.try_recv() {
      changed |= self.apply(message);
    }

    changed
  }

  /// Wait for the next state change: the load starting, settling, or a
  /// refresh being triggered.
  pub async fn changed(&mut self) {
    loop {
      let refresh_at = self.next_refresh;
      let refresh = async move {
        match refresh_at {
          Some(at) => tokio::time::sleep_until(at).await,
          None => std::future::pending().await,
        }
      };

      tokio::select! {
        message = self.rx.recv() => {
          if let Some(message) = message {
            if self.apply(message) {
              return;
            }
          }
        }
        _ = refresh => {
          self.refetch();
          return;
        }
      }
    }
  }

  fn refresh_due(&self, now: Instant) -> bool {
    matches!(self.next_refresh, Some(at) if now >= at)
  }

  fn start(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel.cancel();
    }

    self.trigger += 1;
    self.phase = Phase::Pending;
    self.next_refresh = None;

    let trigger = self.trigger;
    let token = CancellationToken::new();
    self.cancel = Some(token.clone());

    let service = self.service.clone();
    let endpoint = self.endpoint.clone();
    let params = self.params.clone();
    let debounce = self.debounce;
    let tx = self.tx.clone();

    trace!(endpoint = %endpoint, trigger, "query triggered");

    tokio::spawn(async move {
      tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(debounce) => {}
      }

      if tx.send(Message::Started(trigger)).is_err() {
        return;
      }
      let result = service.load(&endpoint, &params, &token).await;
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(Message::Settled(trigger, result));
    });
  }

  fn apply(&mut self, message: Message) -> bool {
    match message {
      Message::Started(trigger) if trigger == self.trigger => {
        self.phase = Phase::InFlight;
        true
      }
      Message::Settled(trigger, result) if trigger == self.trigger => {
        self.cancel = None;
        self.settle(result);
        true
      }
      // Outcome of a superseded trigger
      _ => false,
    }
  }

  fn settle(&mut self, result: Result<CacheResult<Arc<Value>>, FetchError>) {
    match result {
      Ok(loaded) => {
        let unchanged = self
          .payload
          .as_ref()
          .is_some_and(|current| Arc::ptr_eq(current, &loaded.data));

        if !unchanged {
          match T::deserialize(&*loaded.data) {
            Ok(data) => {
              self.data = Some(Arc::new(data));
              self.payload = Some(loaded.data);
              self.error = None;
            }
            Err(e) => self.error = Some(FetchError::from(e)),
          }
        } else {
          self.error = None;
        }
        self.source = Some(loaded.source);
        self.phase = Phase::Settled;
      }
      Err(FetchError::Aborted) => {
        debug!(endpoint = %self.endpoint, "load aborted");
        self.phase = if self.data.is_some() || self.error.is_some() {
          Phase::Settled
        } else {
          Phase::Idle
        };
        return;
      }
      Err(e) => {
        // Previous data stays visible alongside the error.
        self.error = Some(e);
        self.phase = Phase::Settled;
      }
    }

    if !self.refresh_interval.is_zero() {
      self.next_refresh = Some(Instant::now() + self.refresh_interval);
    }
  }
}

impl<T, F: Fetcher> Drop for Query<T, F> {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel.cancel();
    }
  }
}

impl<T: std::fmt::Debug, F: Fetcher> std::fmt::Debug for Query<T, F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("endpoint", &self.endpoint)
      .field("params", &self.params)
      .field("phase", &self.phase)
      .field("data", &self.data)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CachePolicy;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Echoes the request back after `delay`; fails while `fail` is set.
  struct EchoFetcher {
    calls: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
    last_params: parking_lot::Mutex<Option<Params>>,
    delay: Duration,
    fail: parking_lot::Mutex<bool>,
  }

  struct AbortCounter(Arc<AtomicUsize>, bool);

  impl Drop for AbortCounter {
    fn drop(&mut self) {
      if !self.1 {
        self.0.fetch_add(1, Ordering::SeqCst);
      }
    }
  }

  impl Fetcher for EchoFetcher {
    fn fetch_json(
      &self,
      endpoint: &str,
      params: &Params,
    ) -> impl std::future::Future<Output = Result<Value, FetchError>> + Send {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      *self.last_params.lock() = Some(params.clone());
      let fail = *self.fail.lock();
      let delay = self.delay;
      let body = json!([{ "endpoint": endpoint, "days": params.get("days"), "call": n }]);
      let counter = AbortCounter(Arc::clone(&self.aborted), false);

      async move {
        let mut counter = counter;
        tokio::time::sleep(delay).await;
        counter.1 = true;
        if fail {
          Err(FetchError::Network("connection reset".to_string()))
        } else {
          Ok(body)
        }
      }
    }
  }

  fn service(delay_ms: u64) -> FetchService<EchoFetcher> {
    FetchService::new(
      EchoFetcher {
        calls: Arc::new(AtomicUsize::new(0)),
        aborted: Arc::new(AtomicUsize::new(0)),
        last_params: parking_lot::Mutex::new(None),
        delay: Duration::from_millis(delay_ms),
        fail: parking_lot::Mutex::new(false),
      },
      CachePolicy {
        freshness: Duration::from_secs(60),
        ..CachePolicy::default()
      },
    )
  }

  fn calls(svc: &FetchService<EchoFetcher>) -> usize {
    svc.fetcher().calls.load(Ordering::SeqCst)
  }

  /// Drive the query until it leaves the loading phases.
  async fn settle<T, F>(query: &mut Query<T, F>)
  where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fetcher,
  {
    while query.is_loading() {
      query.changed().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_success() {
    let svc = service(10);
    let mut query: Query<Value, _> =
      Query::new(svc.clone(), "/api/data/PM2.5", Params::new().with("days", 1));

    assert_eq!(query.phase(), Phase::Idle);
    query.fetch();
    assert!(query.view().loading);

    settle(&mut query).await;

    let view = query.view();
    assert!(!view.loading);
    assert!(view.error.is_none());
    assert_eq!(view.data.unwrap()[0]["days"], json!("1"));
    assert_eq!(query.source(), Some(CacheSource::Network));
  }

  #[tokio::test(start_paused = true)]
  async fn test_second_consumer_gets_same_data_from_cache() {
    let svc = service(10);
    let params = Params::new().with("days", 1);

    let mut first: Query<Value, _> = Query::new(svc.clone(), "/api/data/PM2.5", params.clone());
    first.fetch();
    settle(&mut first).await;

    let mut second: Query<Value, _> = Query::new(svc.clone(), "/api/data/PM2.5", params);
    second.fetch();
    settle(&mut second).await;

    assert_eq!(calls(&svc), 1);
    assert_eq!(second.source(), Some(CacheSource::CacheFresh));
    assert_eq!(first.data(), second.data());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_while_loading_is_noop() {
    let svc = service(100);
    let mut query: Query<Value, _> = Query::new(svc.clone(), "/api/averages", Params::new());

    query.fetch();
    query.fetch();
    settle(&mut query).await;

    assert_eq!(calls(&svc), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_param_churn_is_debounced() {
    let svc = service(10);
    let mut query: Query<Value, _> =
      Query::new(svc.clone(), "/api/data/NO2", Params::new().with("days", 1));

    query.fetch();
    for days in [3, 7, 30] {
      tokio::time::sleep(Duration::from_millis(50)).await;
      query.set_params(Params::new().with("days", days));
    }
    settle(&mut query).await;

    assert_eq!(calls(&svc), 1);
    assert_eq!(
      svc.fetcher().last_params.lock().as_ref().unwrap().get("days"),
      Some("30")
    );
    assert_eq!(query.data().unwrap()[0]["days"], json!("30"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_param_change_cancels_inflight_without_error() {
    let svc = service(1_000);
    let mut query: Query<Value, _> =
      Query::new(svc.clone(), "/api/data/O3", Params::new().with("days", 1))
        .with_debounce(Duration::ZERO);

    query.fetch();
    query.changed().await;
    assert_eq!(query.phase(), Phase::InFlight);

    query.set_params(Params::new().with("days", 7));
    settle(&mut query).await;

    assert!(query.error().is_none());
    assert_eq!(query.data().unwrap()[0]["days"], json!("7"));
    assert_eq!(calls(&svc), 2);
    assert_eq!(svc.fetcher().aborted.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_before_settle_cancels_request() {
    let svc = service(1_000);
    {
      let mut query: Query<Value, _> =
        Query::new(svc.clone(), "/api/averages", Params::new().with("variable", "NO2"))
          .with_debounce(Duration::ZERO);
      query.fetch();
      query.changed().await;
      assert_eq!(query.phase(), Phase::InFlight);
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(svc.fetcher().aborted.load(Ordering::SeqCst), 1);
    assert_eq!(svc.inflight_len(), 0);
    assert_eq!(svc.cached_len(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_one_consumer_keeps_shared_request() {
    let svc = service(500);
    let params = Params::new().with("days", 1);

    let mut staying: Query<Value, _> = Query::new(svc.clone(), "/api/data/CO", params.clone());
    {
      let mut leaving: Query<Value, _> = Query::new(svc.clone(), "/api/data/CO", params);
      leaving.fetch();
      staying.fetch();
      leaving.changed().await;
      staying.changed().await;
      assert_eq!(leaving.phase(), Phase::InFlight);
      assert_eq!(staying.phase(), Phase::InFlight);
    }

    settle(&mut staying).await;
    assert!(staying.error().is_none());
    assert!(staying.data().is_some());
    assert_eq!(calls(&svc), 1);
    assert_eq!(svc.fetcher().aborted.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_uses_cache_until_expired() {
    let svc = service(10);
    let mut query: Query<Value, _> =
      Query::new(svc.clone(), "/api/data/PM10", Params::new().with("days", 1))
        .with_refresh_interval(Duration::from_secs(40));

    query.fetch();
    settle(&mut query).await;
    let first = Arc::clone(query.data().unwrap());

    // Refresh at ~40s: still fresh, no request, same data.
    query.changed().await;
    assert!(query.is_loading());
    settle(&mut query).await;
    assert_eq!(calls(&svc), 1);
    assert!(Arc::ptr_eq(&first, query.data().unwrap()));

    // Refresh at ~80s: expired, exactly one new request.
    query.changed().await;
    settle(&mut query).await;
    assert_eq!(calls(&svc), 2);
    assert_eq!(query.data().unwrap()[0]["call"], json!(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_keeps_previous_data() {
    let svc = service(10);
    let mut query: Query<Value, _> =
      Query::new(svc.clone(), "/api/data/Humidity", Params::new().with("days", 1))
        .with_refresh_interval(Duration::ZERO);

    query.fetch();
    settle(&mut query).await;
    assert!(query.data().is_some());

    tokio::time::sleep(Duration::from_secs(61)).await;
    *svc.fetcher().fail.lock() = true;
    query.refetch();
    settle(&mut query).await;

    let view = query.view();
    assert!(view.data.is_some());
    assert!(matches!(view.error, Some(FetchError::Network(_))));
    assert_eq!(query.phase(), Phase::Settled);
  }

  #[tokio::test(start_paused = true)]
  async fn test_decode_error_surfaces() {
    #[derive(Debug, serde::Deserialize)]
    struct Expect {
      #[allow(dead_code)]
      mae: f64,
    }

    let svc = service(10);
    let mut query: Query<Expect, _> = Query::new(svc, "/api/forecast/NO2", Params::new());

    query.fetch();
    settle(&mut query).await;

    assert!(query.data().is_none());
    assert!(matches!(query.error(), Some(FetchError::Decode(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_applies_results() {
    let svc = service(10);
    let mut query: Query<Value, _> = Query::new(svc, "/api/averages", Params::new())
      .with_debounce(Duration::from_millis(20));

    query.fetch();
    assert!(!query.poll());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(query.poll());
    assert_eq!(query.phase(), Phase::Settled);
    assert!(query.data().is_some());
  }
}
