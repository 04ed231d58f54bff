//! Cache-wide defaults, per key-pattern overrides and per-read options.

use std::time::Duration;

use crate::key::QueryKey;

/// Policy applied to every key under `prefix`.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
  pub prefix: QueryKey,
  pub stale_time: Option<Duration>,
  pub retry: Option<u32>,
}

/// Configuration supplied when a cache is constructed.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How long fetched data stays fresh
  pub stale_time: Duration,
  /// How long an entry with no subscribers is kept before it is dropped
  pub gc_time: Duration,
  /// Extra attempts after a failed fetch
  pub retry: u32,
  /// Fixed pause between attempts
  pub retry_delay: Duration,
  /// Per key-pattern overrides; the longest matching prefix wins
  pub overrides: Vec<KeyPolicy>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::from_secs(5 * 60),
      retry: 1,
      retry_delay: Duration::ZERO,
      overrides: Vec::new(),
    }
  }
}

impl CacheConfig {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  pub fn with_override(mut self, policy: KeyPolicy) -> Self {
    self.overrides.push(policy);
    self
  }

  pub(crate) fn stale_time_for(&self, key: &QueryKey) -> Duration {
    self
      .longest_match(key, |p| p.stale_time)
      .unwrap_or(self.stale_time)
  }

  pub(crate) fn retry_for(&self, key: &QueryKey) -> u32 {
    self.longest_match(key, |p| p.retry).unwrap_or(self.retry)
  }

  fn longest_match<T>(&self, key: &QueryKey, pick: impl Fn(&KeyPolicy) -> Option<T>) -> Option<T> {
    self
      .overrides
      .iter()
      .filter(|p| p.prefix.is_prefix_of(key))
      .filter_map(|p| pick(p).map(|v| (p.prefix.len(), v)))
      .max_by_key(|(len, _)| *len)
      .map(|(_, v)| v)
  }
}

/// Options for a single read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
  /// Fetch even if the entry is fresh
  pub force: bool,
  /// Keep the last successful data when this fetch fails
  pub keep_previous_data: bool,
  /// Overrides the configured stale time for this key
  pub stale_time: Option<Duration>,
  /// Overrides the configured retry count for this fetch
  pub retry: Option<u32>,
}

impl ReadOptions {
  pub fn forced() -> Self {
    Self {
      force: true,
      ..Self::default()
    }
  }

  pub fn keep_previous_data(mut self) -> Self {
    self.keep_previous_data = true;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = Some(retry);
    self
  }
}
