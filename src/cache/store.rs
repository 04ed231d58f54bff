//! The query cache: keyed entries, shared in-flight fetches, subscribers and GC.

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{Entry, QueryStatus};
use super::policy::{CacheConfig, ReadOptions};
use super::subscription::Subscription;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::transport::{FetcherFn, TransportError};

/// Subscriber callback, invoked with a snapshot on every transition
pub type Callback = Arc<dyn Fn(&Entry) + Send + Sync>;

/// Settles to the entry snapshot taken when the fetch completed
type FetchHandle = Shared<BoxFuture<'static, Entry>>;

/// Process-wide mirror of server-owned state.
///
/// Cloning is cheap and yields another handle to the same cache. Operations
/// that may start a fetch or a timer must be called from within a tokio
/// runtime.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

pub(crate) struct Inner {
  config: CacheConfig,
  state: Mutex<State>,
  next_id: AtomicU64,
}

#[derive(Default)]
struct State {
  slots: HashMap<QueryKey, Slot>,
  disposed: bool,
}

struct Slot {
  entry: Entry,
  /// Most recent fetcher, reused when an invalidation needs a refetch
  fetcher: Option<FetcherFn>,
  retry: Option<u32>,
  keep_previous_data: bool,
  in_flight: Option<InFlight>,
  /// Invalidated while a fetch was running; its result is already outdated
  pending_invalidation: bool,
  subscribers: Vec<(u64, Callback)>,
  outbox: Arc<Outbox>,
  gc_task: Option<JoinHandle<()>>,
}

struct InFlight {
  id: u64,
  handle: FetchHandle,
  driver: JoinHandle<()>,
}

struct Notification {
  callbacks: Vec<Callback>,
  entry: Entry,
}

impl Notification {
  fn deliver(self) {
    for callback in &self.callbacks {
      callback(&self.entry);
    }
  }
}

/// Per-entry notification queue.
///
/// Snapshots are queued while the state lock is held, so queue order is
/// transition order. Whichever caller drains first delivers everything queued,
/// one notification at a time, with no lock held during callbacks.
#[derive(Default)]
struct Outbox {
  queue: Mutex<OutboxQueue>,
}

#[derive(Default)]
struct OutboxQueue {
  pending: VecDeque<Notification>,
  draining: bool,
}

impl Outbox {
  fn lock(&self) -> MutexGuard<'_, OutboxQueue> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn push(&self, notification: Notification) {
    self.lock().pending.push_back(notification);
  }

  /// Returns at once if another caller is already draining; that caller also
  /// delivers what was queued here.
  fn drain(&self) {
    {
      let mut queue = self.lock();
      if queue.draining {
        return;
      }
      queue.draining = true;
    }
    loop {
      let next = {
        let mut queue = self.lock();
        match queue.pending.pop_front() {
          Some(notification) => notification,
          None => {
            queue.draining = false;
            return;
          }
        }
      };
      next.deliver();
    }
  }
}

impl Slot {
  fn new(entry: Entry) -> Self {
    Self {
      entry,
      fetcher: None,
      retry: None,
      keep_previous_data: false,
      in_flight: None,
      pending_invalidation: false,
      subscribers: Vec::new(),
      outbox: Arc::default(),
      gc_task: None,
    }
  }

  /// Queue the current snapshot for subscribers. Drain the returned outbox
  /// after the state lock is released.
  fn notify(&self) -> Arc<Outbox> {
    if !self.subscribers.is_empty() {
      self.outbox.push(Notification {
        callbacks: self.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        entry: self.entry.clone(),
      });
    }
    Arc::clone(&self.outbox)
  }

  fn abort_tasks(&mut self) {
    if let Some(gc) = self.gc_task.take() {
      gc.abort();
    }
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.driver.abort();
    }
  }
}

impl QueryCache {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        config,
        state: Mutex::new(State::default()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// Return the current entry for `key`, starting a fetch if it is missing,
  /// stale or `options.force` is set.
  ///
  /// If a fetch for this key is already in flight no new one is started; the
  /// caller shares the running one. The returned snapshot reflects the state
  /// right after this call (typically `Loading` when a fetch was started,
  /// with any previous data still present).
  pub fn read<F, Fut, T>(&self, key: &QueryKey, fetcher: F, options: ReadOptions) -> Result<Entry>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, TransportError>> + Send + 'static,
    T: Serialize + Send + 'static,
  {
    let (entry, _) = self.inner.read(key, erase(fetcher), &options)?;
    Ok(entry)
  }

  /// Like [`read`](Self::read), but waits for the in-flight fetch (if any)
  /// to settle and returns the settled entry.
  pub async fn fetch<F, Fut, T>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: ReadOptions,
  ) -> Result<Entry>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, TransportError>> + Send + 'static,
    T: Serialize + Send + 'static,
  {
    let (entry, pending) = self.inner.read(key, erase(fetcher), &options)?;
    match pending {
      Some(handle) => Ok(handle.await),
      None => Ok(entry),
    }
  }

  /// Peek at an entry without creating it or fetching.
  pub fn get(&self, key: &QueryKey) -> Result<Option<Entry>> {
    let state = self.inner.lock()?;
    Ok(state.slots.get(key).map(|slot| slot.entry.clone()))
  }

  /// Write data directly, as if a fetch had just succeeded.
  pub fn set_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<Entry> {
    let value = serde_json::to_value(data).map_err(Error::serialization)?;
    let (entry, outbox) = {
      let mut state = self.inner.lock()?;
      let stale_after = self.inner.config.stale_time_for(key);
      let slot = state
        .slots
        .entry(key.clone())
        .or_insert_with(|| Slot::new(Entry::idle(key.clone(), stale_after)));
      apply_success(&mut slot.entry, value);
      if slot.subscribers.is_empty() && slot.in_flight.is_none() {
        self.inner.schedule_gc(key, slot);
      }
      (slot.entry.clone(), slot.notify())
    };
    outbox.drain();
    Ok(entry)
  }

  /// Mark every entry whose key satisfies `predicate` as stale.
  ///
  /// Entries with at least one subscriber are refetched right away; the rest
  /// stay stale until their next read. Returns the number of entries marked.
  pub fn invalidate<P>(&self, predicate: P) -> Result<usize>
  where
    P: Fn(&QueryKey) -> bool,
  {
    self.inner.invalidate(predicate)
  }

  /// Invalidate `prefix` and every key below it.
  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Result<usize> {
    self.invalidate(|key| prefix.is_prefix_of(key))
  }

  /// Register interest in `key`; `callback` runs on every transition of it.
  ///
  /// Dropping the returned guard unsubscribes.
  pub fn subscribe<C>(&self, key: &QueryKey, callback: C) -> Result<Subscription>
  where
    C: Fn(&Entry) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let mut state = self.inner.lock()?;
    let stale_after = self.inner.config.stale_time_for(key);
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(Entry::idle(key.clone(), stale_after)));
    if let Some(gc) = slot.gc_task.take() {
      gc.abort();
    }
    slot.subscribers.push((id, Arc::new(callback)));
    slot.entry.subscriber_count = slot.subscribers.len();
    Ok(Subscription::new(Arc::downgrade(&self.inner), key.clone(), id))
  }

  /// Drop an entry immediately, cancelling its timers.
  pub fn remove(&self, key: &QueryKey) -> Result<Option<Entry>> {
    let mut state = self.inner.lock()?;
    Ok(state.slots.remove(key).map(|mut slot| {
      slot.abort_tasks();
      slot.entry
    }))
  }

  pub fn len(&self) -> usize {
    self.inner.lock().map(|s| s.slots.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self
      .inner
      .lock()
      .map(|s| s.slots.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Tear the cache down: abort pending fetch drivers and GC timers and drop
  /// every entry. Any later operation fails with [`Error::Disposed`].
  pub fn dispose(&self) {
    let mut state = self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    state.disposed = true;
    for (_, mut slot) in state.slots.drain() {
      slot.abort_tasks();
    }
    debug!("query cache disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.lock().is_err()
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}

impl Inner {
  fn lock(&self) -> Result<MutexGuard<'_, State>> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.disposed {
      return Err(Error::Disposed);
    }
    Ok(state)
  }

  fn read(
    self: &Arc<Self>,
    key: &QueryKey,
    fetcher: FetcherFn,
    options: &ReadOptions,
  ) -> Result<(Entry, Option<FetchHandle>)> {
    let (entry, pending, outbox) = {
      let mut state = self.lock()?;
      let stale_after = options
        .stale_time
        .unwrap_or_else(|| self.config.stale_time_for(key));
      let slot = state
        .slots
        .entry(key.clone())
        .or_insert_with(|| Slot::new(Entry::idle(key.clone(), stale_after)));

      slot.entry.stale_after = stale_after;
      slot.fetcher = Some(Arc::clone(&fetcher));
      slot.retry = options.retry;
      slot.keep_previous_data = options.keep_previous_data;

      if let Some(in_flight) = &slot.in_flight {
        (slot.entry.clone(), Some(in_flight.handle.clone()), None)
      } else if options.force || slot.entry.is_stale_at(Instant::now()) {
        let handle = self.start_fetch(key, slot, fetcher);
        (slot.entry.clone(), Some(handle), Some(slot.notify()))
      } else {
        (slot.entry.clone(), None, None)
      }
    };

    if let Some(outbox) = outbox {
      outbox.drain();
    }
    Ok((entry, pending))
  }

  /// Move `slot` to `Loading` and spawn its fetch. Caller holds the lock, so
  /// the fetch cannot settle before `in_flight` is recorded.
  fn start_fetch(self: &Arc<Self>, key: &QueryKey, slot: &mut Slot, fetcher: FetcherFn) -> FetchHandle {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let retry = slot.retry.unwrap_or_else(|| self.config.retry_for(key));
    let retry_delay = self.config.retry_delay;
    let keep_previous_data = slot.keep_previous_data;
    let weak = Arc::downgrade(self);
    let owned_key = key.clone();

    let future: BoxFuture<'static, Entry> = async move {
      let outcome = fetch_with_retry(&owned_key, &fetcher, retry, retry_delay).await;
      match weak.upgrade() {
        Some(inner) => inner.settle(&owned_key, id, outcome, keep_previous_data),
        None => detached(owned_key, outcome),
      }
    }
    .boxed();

    let handle = future.shared();
    let driver = tokio::spawn(handle.clone().map(|_| ()));

    slot.entry.status = QueryStatus::Loading;
    slot.entry.error = None;
    slot.entry.is_fetching = true;
    slot.entry.updated_at = Some(Utc::now());
    slot.in_flight = Some(InFlight {
      id,
      handle: handle.clone(),
      driver,
    });
    debug!(%key, fetch_id = id, "fetch started");
    handle
  }

  fn settle(
    self: &Arc<Self>,
    key: &QueryKey,
    id: u64,
    outcome: std::result::Result<Value, TransportError>,
    keep_previous_data: bool,
  ) -> Entry {
    let (settled, outbox) = {
      let mut state = match self.lock() {
        Ok(state) => state,
        Err(_) => return detached(key.clone(), outcome),
      };
      let slot = match state.slots.get_mut(key) {
        Some(slot) if slot.in_flight.as_ref().map(|f| f.id) == Some(id) => slot,
        // Removed or collected while the fetch was running
        _ => return detached(key.clone(), outcome),
      };

      slot.in_flight = None;
      let outdated = std::mem::take(&mut slot.pending_invalidation);
      match outcome {
        Ok(data) => apply_success(&mut slot.entry, data),
        Err(err) => {
          slot.entry.status = QueryStatus::Error;
          slot.entry.error = Some(err);
          slot.entry.is_fetching = false;
          slot.entry.is_invalidated = false;
          slot.entry.updated_at = Some(Utc::now());
          if !keep_previous_data {
            slot.entry.data = None;
          }
        }
      }
      slot.entry.is_invalidated |= outdated;
      debug!(%key, fetch_id = id, status = ?slot.entry.status, "fetch settled");
      let outbox = slot.notify();
      let settled = slot.entry.clone();

      if slot.subscribers.is_empty() {
        self.schedule_gc(key, slot);
      } else if outdated {
        if let Some(fetcher) = slot.fetcher.clone() {
          self.start_fetch(key, slot, fetcher);
          slot.notify();
        }
      }
      (settled, outbox)
    };

    outbox.drain();
    settled
  }

  fn invalidate<P>(self: &Arc<Self>, predicate: P) -> Result<usize>
  where
    P: Fn(&QueryKey) -> bool,
  {
    let mut refetching = Vec::new();
    let mut marked = 0;
    {
      let mut state = self.lock()?;
      for (key, slot) in state.slots.iter_mut() {
        if !predicate(key) {
          continue;
        }
        marked += 1;
        slot.entry.is_invalidated = true;

        if slot.in_flight.is_some() {
          slot.pending_invalidation = true;
        } else if !slot.subscribers.is_empty() {
          if let Some(fetcher) = slot.fetcher.clone() {
            self.start_fetch(key, slot, fetcher);
            refetching.push(slot.notify());
          }
        }
      }
    }
    debug!(marked, refetching = refetching.len(), "invalidated entries");

    for outbox in refetching {
      outbox.drain();
    }
    Ok(marked)
  }

  pub(crate) fn unsubscribe(self: &Arc<Self>, key: &QueryKey, id: u64) {
    let Ok(mut state) = self.lock() else {
      return;
    };
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    slot.subscribers.retain(|(sub_id, _)| *sub_id != id);
    slot.entry.subscriber_count = slot.subscribers.len();

    // No timer available outside a runtime; collect right away
    if slot.subscribers.is_empty() && !self.schedule_gc(key, slot) {
      if let Some(mut slot) = state.slots.remove(key) {
        slot.abort_tasks();
      }
    }
  }

  /// (Re)start the GC timer of an entry nobody subscribes to. Returns false
  /// when there is no runtime to run the timer on.
  fn schedule_gc(self: &Arc<Self>, key: &QueryKey, slot: &mut Slot) -> bool {
    if let Some(previous) = slot.gc_task.take() {
      previous.abort();
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return false;
    };
    let gc_time = self.config.gc_time;
    let weak = Arc::downgrade(self);
    let owned_key = key.clone();
    slot.gc_task = Some(runtime.spawn(async move {
      tokio::time::sleep(gc_time).await;
      if let Some(inner) = weak.upgrade() {
        inner.collect(&owned_key);
      }
    }));
    true
  }

  /// Drop an entry whose GC delay elapsed, unless it gained a subscriber or a
  /// fetch in the meantime. A running fetch reschedules GC when it settles.
  fn collect(&self, key: &QueryKey) {
    let Ok(mut state) = self.lock() else {
      return;
    };
    let idle = state
      .slots
      .get(key)
      .map(|slot| slot.subscribers.is_empty() && slot.in_flight.is_none())
      .unwrap_or(false);
    if idle {
      if let Some(mut slot) = state.slots.remove(key) {
        // Running inside the GC task itself; only the fetch driver needs stopping
        slot.gc_task = None;
        slot.abort_tasks();
      }
      debug!(%key, "entry garbage collected");
    }
  }
}

fn apply_success(entry: &mut Entry, data: Value) {
  entry.status = QueryStatus::Success;
  entry.data = Some(data);
  entry.error = None;
  entry.last_fetched_at = Some(Instant::now());
  entry.updated_at = Some(Utc::now());
  entry.is_invalidated = false;
  entry.is_fetching = false;
}

/// Snapshot for a fetch whose entry no longer exists in the cache
fn detached(key: QueryKey, outcome: std::result::Result<Value, TransportError>) -> Entry {
  let mut entry = Entry::idle(key, Duration::ZERO);
  match outcome {
    Ok(data) => apply_success(&mut entry, data),
    Err(err) => {
      entry.status = QueryStatus::Error;
      entry.error = Some(err);
      entry.updated_at = Some(Utc::now());
    }
  }
  entry
}

async fn fetch_with_retry(
  key: &QueryKey,
  fetcher: &FetcherFn,
  retry: u32,
  retry_delay: Duration,
) -> std::result::Result<Value, TransportError> {
  let mut attempt = 0;
  loop {
    match fetcher().await {
      Ok(value) => return Ok(value),
      Err(err) if attempt < retry => {
        attempt += 1;
        warn!(%key, %err, attempt, "fetch failed, retrying");
        if !retry_delay.is_zero() {
          tokio::time::sleep(retry_delay).await;
        }
      }
      Err(err) => {
        warn!(%key, %err, "fetch failed");
        return Err(err);
      }
    }
  }
}

/// Box a typed fetcher into the cache's JSON-valued form.
fn erase<F, Fut, T>(fetcher: F) -> FetcherFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = std::result::Result<T, TransportError>> + Send + 'static,
  T: Serialize + Send + 'static,
{
  Arc::new(move || {
    let future = fetcher();
    async move {
      let data = future.await?;
      Ok::<_, TransportError>(serde_json::to_value(data)?)
    }
    .boxed()
  })
}
