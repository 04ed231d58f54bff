//! Entry snapshots handed out by the cache.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::transport::TransportError;

/// Lifecycle status of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Created but never fetched
  Idle,
  /// A fetch is in flight (previous data may still be served)
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed after its retries
  Error,
}

impl QueryStatus {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryStatus::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryStatus::Success)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryStatus::Error)
  }
}

/// Owned snapshot of one cache entry.
///
/// Entries are only ever mutated inside the cache; consumers receive copies,
/// so a subscriber can never observe a half-applied transition.
#[derive(Debug, Clone)]
pub struct Entry {
  pub key: QueryKey,
  pub status: QueryStatus,
  /// Last successful payload. Kept while a refetch is loading; kept on error
  /// only when the read asked for it.
  pub data: Option<Value>,
  /// Present only in `Error` status
  pub error: Option<TransportError>,
  /// Monotonic time of the last successful fetch, used for staleness
  pub last_fetched_at: Option<Instant>,
  /// Wall-clock time of the last status change, for display
  pub updated_at: Option<DateTime<Utc>>,
  pub stale_after: Duration,
  pub subscriber_count: usize,
  /// Explicitly marked stale by an invalidation
  pub is_invalidated: bool,
  pub is_fetching: bool,
}

impl Entry {
  pub(crate) fn idle(key: QueryKey, stale_after: Duration) -> Self {
    Self {
      key,
      status: QueryStatus::Idle,
      data: None,
      error: None,
      last_fetched_at: None,
      updated_at: None,
      stale_after,
      subscriber_count: 0,
      is_invalidated: false,
      is_fetching: false,
    }
  }

  /// Whether the next read should refetch.
  ///
  /// Never-fetched, invalidated and errored entries are always stale; a
  /// successful entry goes stale once it is older than `stale_after`.
  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now())
  }

  pub(crate) fn is_stale_at(&self, now: Instant) -> bool {
    if self.is_invalidated || self.status.is_error() {
      return true;
    }
    match self.last_fetched_at {
      Some(at) => now.duration_since(at) > self.stale_after,
      None => true,
    }
  }

  /// Decode the cached payload into a concrete type.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    self
      .data
      .as_ref()
      .map(|v| serde_json::from_value(v.clone()).map_err(Error::payload))
      .transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_idle_entry_is_stale() {
    let entry = Entry::idle(QueryKey::root("tasks"), Duration::from_secs(60));
    assert!(entry.is_stale());
    assert_eq!(entry.status, QueryStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_goes_stale_after_ttl() {
    let mut entry = Entry::idle(QueryKey::root("tasks"), Duration::from_secs(60));
    entry.status = QueryStatus::Success;
    entry.last_fetched_at = Some(Instant::now());
    assert!(!entry.is_stale());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(entry.is_stale());
  }

  #[tokio::test]
  async fn test_error_and_invalidated_are_stale() {
    let mut entry = Entry::idle(QueryKey::root("tasks"), Duration::from_secs(60));
    entry.last_fetched_at = Some(Instant::now());
    entry.status = QueryStatus::Error;
    assert!(entry.is_stale());

    entry.status = QueryStatus::Success;
    entry.is_invalidated = true;
    assert!(entry.is_stale());
  }

  #[test]
  fn test_decode() {
    let mut entry = Entry::idle(QueryKey::root("tasks"), Duration::ZERO);
    assert_eq!(entry.decode::<Vec<u32>>().unwrap(), None);

    entry.data = Some(json!([1, 2, 3]));
    assert_eq!(entry.decode::<Vec<u32>>().unwrap(), Some(vec![1, 2, 3]));
    assert!(matches!(entry.decode::<String>(), Err(Error::Payload(_))));
  }
}
