//! Registry of requests currently on the wire, one per signature.

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::signature::Signature;
use crate::api::FetchError;

/// Outcome of an operation and the instant its payload was stored, awaitable
/// by any number of waiters.
pub type SharedOutcome = Shared<BoxFuture<'static, Result<(Arc<Value>, Instant), FetchError>>>;

/// One pending operation.
pub struct Inflight {
  generation: u64,
  outcome: SharedOutcome,
  token: CancellationToken,
  waiters: usize,
}

impl Inflight {
  /// A fresh operation with its starter as the only waiter.
  pub fn new(generation: u64, outcome: SharedOutcome, token: CancellationToken) -> Self {
    Self {
      generation,
      outcome,
      token,
      waiters: 1,
    }
  }
}

#[derive(Default)]
pub struct InflightRegistry {
  ops: HashMap<Signature, Inflight>,
}

impl InflightRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Attach another waiter to the operation for `signature`, if any.
  pub fn join(&mut self, signature: &Signature) -> Option<(u64, SharedOutcome)> {
    self.ops.get_mut(signature).map(|op| {
      op.waiters += 1;
      (op.generation, op.outcome.clone())
    })
  }

  pub fn insert(&mut self, signature: Signature, op: Inflight) {
    debug_assert!(
      !self.ops.contains_key(&signature),
      "second operation registered for {}",
      signature
    );
    self.ops.insert(signature, op);
  }

  /// Remove the entry once its operation has settled. A no-op when the entry
  /// now belongs to a different operation.
  pub fn settle(&mut self, signature: &Signature, generation: u64) -> bool {
    match self.ops.get(signature) {
      Some(op) if op.generation == generation => {
        self.ops.remove(signature);
        true
      }
      _ => false,
    }
  }

  /// Detach one waiter. When it was the last one the entry is removed and its
  /// token returned so the caller can abort the operation.
  pub fn detach(&mut self, signature: &Signature, generation: u64) -> Option<CancellationToken> {
    let op = self.ops.get_mut(signature)?;
    if op.generation != generation {
      return None;
    }

    op.waiters = op.waiters.saturating_sub(1);
    if op.waiters > 0 {
      return None;
    }

    self.ops.remove(signature).map(|op| op.token)
  }

  /// Cancel and forget every pending operation.
  pub fn cancel_all(&mut self) -> usize {
    let count = self.ops.len();
    for (_, op) in self.ops.drain() {
      op.token.cancel();
    }
    count
  }

  #[cfg(test)]
  pub fn waiters(&self, signature: &Signature) -> usize {
    self.ops.get(signature).map(|op| op.waiters).unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }
}
