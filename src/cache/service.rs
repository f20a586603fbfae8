//! Fetch service: response cache plus in-flight de-duplication in front of a
//! [`Fetcher`].

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::inflight::{Inflight, InflightRegistry, SharedOutcome};
use super::signature::Signature;
use super::store::{CachePolicy, ResponseCache};
use super::traits::{CacheResult, CacheSource, Fetcher};
use crate::api::{FetchError, Params};

struct State {
  cache: ResponseCache,
  inflight: InflightRegistry,
  next_generation: u64,
}

/// Shared cache and in-flight registry in front of a fetcher.
///
/// Build one at startup, clone it into every consumer, call
/// [`shutdown`](Self::shutdown) on exit. Clones share state.
///
/// 1. A fresh cache entry is returned without touching the network.
/// 2. Otherwise, a request already in flight for the same signature is joined.
/// 3. Otherwise a new request is started; its result replaces the cache entry.
///
/// Failures never touch the cache.
pub struct FetchService<F: Fetcher> {
  fetcher: Arc<F>,
  state: Arc<Mutex<State>>,
  shutdown: CancellationToken,
}

impl<F: Fetcher> FetchService<F> {
  pub fn new(fetcher: F, policy: CachePolicy) -> Self {
    Self {
      fetcher: Arc::new(fetcher),
      state: Arc::new(Mutex::new(State {
        cache: ResponseCache::new(policy),
        inflight: InflightRegistry::new(),
        next_generation: 0,
      })),
      shutdown: CancellationToken::new(),
    }
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  pub fn freshness(&self) -> Duration {
    self.state.lock().cache.policy().freshness
  }

  /// Load `endpoint` with `params`, from cache when fresh.
  ///
  /// If `cancel` fires before the outcome is known the caller detaches and
  /// gets [`FetchError::Aborted`]; the request itself is aborted only when no
  /// other caller is waiting on it.
  pub async fn load(
    &self,
    endpoint: &str,
    params: &Params,
    cancel: &CancellationToken,
  ) -> Result<CacheResult<Arc<Value>>, FetchError> {
    let signature = Signature::new(endpoint, params);

    let (outcome, waiter, source) = {
      let mut state = self.state.lock();

      if let Some(entry) = state.cache.fresh(&signature, Instant::now()) {
        trace!(%signature, "cache hit");
        return Ok(CacheResult::from_cache(
          Arc::clone(&entry.payload),
          entry.fetched_at,
        ));
      }

      if self.shutdown.is_cancelled() {
        return Err(FetchError::Aborted);
      }

      match state.inflight.join(&signature) {
        Some((generation, outcome)) => {
          debug!(%signature, generation, "joining in-flight request");
          let waiter = Waiter::new(&self.state, signature, generation);
          (outcome, waiter, CacheSource::Joined)
        }
        None => {
          let (generation, outcome) =
            self.start(&mut state, signature.clone(), endpoint, params);
          let waiter = Waiter::new(&self.state, signature, generation);
          (outcome, waiter, CacheSource::Network)
        }
      }
    };

    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        debug!(signature = %waiter.signature, "caller cancelled");
        drop(waiter);
        Err(FetchError::Aborted)
      }
      result = outcome => {
        waiter.settled();
        let (payload, fetched_at) = result?;
        Ok(match source {
          CacheSource::Joined => CacheResult::joined(payload, fetched_at),
          _ => CacheResult::from_network(payload, fetched_at),
        })
      }
    }
  }

  /// Spawn the request for `signature` and register it. Called with the
  /// state lock held so the task cannot settle before it is registered.
  fn start(
    &self,
    state: &mut State,
    signature: Signature,
    endpoint: &str,
    params: &Params,
  ) -> (u64, SharedOutcome) {
    state.next_generation += 1;
    let generation = state.next_generation;
    let token = self.shutdown.child_token();

    debug!(%signature, generation, "starting request");

    let task = {
      let fetcher = Arc::clone(&self.fetcher);
      let shared_state = Arc::clone(&self.state);
      let signature = signature.clone();
      let endpoint = endpoint.to_string();
      let params = params.clone();
      let token = token.clone();

      async move {
        let result = tokio::select! {
          biased;
          _ = token.cancelled() => Err(FetchError::Aborted),
          result = fetcher.fetch_json(&endpoint, &params) => result.map(Arc::new),
        };

        let fetched_at = Instant::now();
        let mut state = shared_state.lock();
        match &result {
          Ok(payload) => {
            state
              .cache
              .store(signature.clone(), Arc::clone(payload), generation, fetched_at);
            debug!(%signature, generation, "request settled");
          }
          Err(FetchError::Aborted) => debug!(%signature, generation, "request aborted"),
          Err(e) => warn!(%signature, generation, error = %e, "request failed"),
        }
        state.inflight.settle(&signature, generation);

        result.map(|payload| (payload, fetched_at))
      }
    };

    let handle = tokio::spawn(task);
    let outcome = async move {
      match handle.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(FetchError::Aborted),
        Err(e) => Err(FetchError::Network(format!("fetch task failed: {}", e))),
      }
    }
    .boxed()
    .shared();

    state
      .inflight
      .insert(signature, Inflight::new(generation, outcome.clone(), token));

    (generation, outcome)
  }

  /// Abort everything in flight and drop all cached data. Later loads fail
  /// with [`FetchError::Aborted`].
  pub fn shutdown(&self) {
    self.shutdown.cancel();
    let mut state = self.state.lock();
    let aborted = state.inflight.cancel_all();
    state.cache.clear();
    debug!(aborted, "fetch service shut down");
  }

  /// Cached payload for a request regardless of freshness.
  #[cfg(test)]
  pub fn peek(&self, endpoint: &str, params: &Params) -> Option<Arc<Value>> {
    let signature = Signature::new(endpoint, params);
    self
      .state
      .lock()
      .cache
      .get(&signature)
      .map(|entry| Arc::clone(&entry.payload))
  }

  pub fn cached_len(&self) -> usize {
    self.state.lock().cache.len()
  }

  pub fn inflight_len(&self) -> usize {
    self.state.lock().inflight.len()
  }
}

impl<F: Fetcher> Clone for FetchService<F> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      state: Arc::clone(&self.state),
      shutdown: self.shutdown.clone(),
    }
  }
}

/// A caller's attachment to an in-flight operation. Dropping it before the
/// outcome arrives detaches the caller, aborting the operation if it was the
/// last one waiting.
struct Waiter {
  state: Arc<Mutex<State>>,
  signature: Signature,
  generation: u64,
  done: bool,
}

impl Waiter {
  fn new(state: &Arc<Mutex<State>>, signature: Signature, generation: u64) -> Self {
    Self {
      state: Arc::clone(state),
      signature,
      generation,
      done: false,
    }
  }

  fn settled(mut self) {
    self.done = true;
  }
}

impl Drop for Waiter {
  fn drop(&mut self) {
    if self.done {
      return;
    }

    let token = self
      .state
      .lock()
      .inflight
      .detach(&self.signature, self.generation);

    if let Some(token) = token {
      debug!(signature = %self.signature, generation = self.generation, "last waiter left, aborting");
      token.cancel();
    }
  }
}
