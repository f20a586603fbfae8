//! In-memory response table keyed by request signature.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::signature::Signature;

/// How long entries stay fresh, how long stale entries are kept around, and
/// how many entries the table may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  pub freshness: Duration,
  pub retention: Duration,
  pub max_entries: usize,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      freshness: Duration::from_secs(60),
      retention: Duration::from_secs(600),
      max_entries: 256,
    }
  }
}

/// A cached payload. Replaced wholesale, never patched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub payload: Arc<Value>,
  pub fetched_at: Instant,
  /// Generation of the operation that produced this payload.
  generation: u64,
}

/// Signature → payload table with freshness, retention and a size bound.
#[derive(Debug)]
pub struct ResponseCache {
  entries: HashMap<Signature, CacheEntry>,
  policy: CachePolicy,
}

impl ResponseCache {
  pub fn new(policy: CachePolicy) -> Self {
    let policy = CachePolicy {
      retention: policy.retention.max(policy.freshness),
      max_entries: policy.max_entries.max(1),
      ..policy
    };

    Self {
      entries: HashMap::new(),
      policy,
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
    now.saturating_duration_since(entry.fetched_at) < self.policy.freshness
  }

  /// Entry for `signature` if it is younger than the freshness window.
  pub fn fresh(&self, signature: &Signature, now: Instant) -> Option<&CacheEntry> {
    self
      .entries
      .get(signature)
      .filter(|entry| self.is_fresh(entry, now))
  }

  /// Entry for `signature` regardless of age.
  pub fn get(&self, signature: &Signature) -> Option<&CacheEntry> {
    self.entries.get(signature)
  }

  /// Store a payload produced by operation `generation`.
  ///
  /// Returns false (and keeps the current entry) when the current entry came
  /// from a later operation.
  pub fn store(
    &mut self,
    signature: Signature,
    payload: Arc<Value>,
    generation: u64,
    now: Instant,
  ) -> bool {
    if let Some(existing) = self.entries.get(&signature) {
      if existing.generation > generation {
        debug!(%signature, generation, newer = existing.generation, "discarding superseded payload");
        return false;
      }
    }

    self.entries.insert(
      signature,
      CacheEntry {
        payload,
        fetched_at: now,
        generation,
      },
    );
    self.sweep(now);
    true
  }

  /// Drop entries past the retention window, then the oldest entries while
  /// over capacity. Returns how many were removed.
  pub fn sweep(&mut self, now: Instant) -> usize {
    let before = self.entries.len();
    let retention = self.policy.retention;
    self
      .entries
      .retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < retention);

    while self.entries.len() > self.policy.max_entries {
      let oldest = self
        .entries
        .iter()
        .min_by_key(|(_, entry)| (entry.fetched_at, entry.generation))
        .map(|(signature, _)| signature.clone());
      match oldest {
        Some(signature) => {
          self.entries.remove(&signature);
        }
        None => break,
      }
    }

    let removed = before - self.entries.len();
    if removed > 0 {
      debug!(removed, remaining = self.entries.len(), "evicted cache entries");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}
