use std::sync::Weak;

use super::store::Inner;
use crate::key::QueryKey;

/// Guard for a cache subscription. Dropping it unsubscribes.
///
/// When the last subscriber of an entry leaves, the entry's GC timer starts.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  cache: Weak<Inner>,
  key: QueryKey,
  id: u64,
}

impl Subscription {
  pub(crate) fn new(cache: Weak<Inner>, key: QueryKey, id: u64) -> Self {
    Self { cache, key, id }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Explicit form of dropping the guard.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.cache.upgrade() {
      inner.unsubscribe(&self.key, self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}
