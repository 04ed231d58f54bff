//! Composite fetches: one load-bearing primary plus degradable auxiliaries.
//!
//! The primary decides the outcome. If it fails the composite fails and no
//! auxiliary is started. Once it succeeds every auxiliary runs concurrently,
//! and an auxiliary that fails is replaced by the default declared for its
//! slot, so the composite itself always succeeds.
//!
//! ```ignore
//! let detail = CompositeFetch::new(move || api.get_task(id))
//!   .auxiliary("comments", move || api.list_comments(id), Vec::<Comment>::new())
//!   .auxiliary("links", move || api.list_links(id), Vec::<Link>::new())
//!   .run()
//!   .await?;
//!
//! let comments: &Vec<Comment> = detail.get("comments").unwrap();
//! ```

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, warn};

use crate::transport::TransportError;

type AnyValue = Box<dyn Any + Send>;
type AuxStarter = Box<dyn FnOnce() -> BoxFuture<'static, AuxSlot> + Send>;

/// One settled auxiliary slot
struct AuxSlot {
  value: AnyValue,
  /// The failure that was replaced by the default, if any
  fallback: Option<TransportError>,
}

/// Builder for a primary fetch and its named auxiliary fetches.
pub struct CompositeFetch<P> {
  primary: BoxFuture<'static, Result<P, TransportError>>,
  auxiliaries: Vec<(String, AuxStarter)>,
}

impl<P: Send + 'static> CompositeFetch<P> {
  /// The primary fetch is started first and only once `run` is awaited.
  pub fn new<F, Fut>(primary: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<P, TransportError>> + Send + 'static,
  {
    Self {
      primary: async move { primary().await }.boxed(),
      auxiliaries: Vec::new(),
    }
  }

  /// Add an auxiliary slot. A failure of `fetch` is logged and replaced by
  /// `default`. Declaring the same name twice keeps the later declaration.
  pub fn auxiliary<T, F, Fut>(mut self, name: impl Into<String>, fetch: F, default: T) -> Self
  where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
  {
    let name = name.into();
    let slot_name = name.clone();
    let starter: AuxStarter = Box::new(move || {
      async move {
        match fetch().await {
          Ok(value) => AuxSlot {
            value: Box::new(value),
            fallback: None,
          },
          Err(err) => {
            warn!(slot = %slot_name, %err, "auxiliary fetch failed, using default");
            AuxSlot {
              value: Box::new(default),
              fallback: Some(err),
            }
          }
        }
      }
      .boxed()
    });
    self.auxiliaries.retain(|(existing, _)| *existing != name);
    self.auxiliaries.push((name, starter));
    self
  }

  /// Resolve the primary, then every auxiliary concurrently.
  pub async fn run(self) -> Result<CompositeResult<P>, TransportError> {
    let primary = self.primary.await?;

    let (names, starters): (Vec<_>, Vec<_>) = self.auxiliaries.into_iter().unzip();
    let settled = join_all(starters.into_iter().map(|start| start())).await;
    let slots: BTreeMap<String, AuxSlot> = names.into_iter().zip(settled).collect();

    debug!(
      auxiliaries = slots.len(),
      degraded = slots.values().filter(|s| s.fallback.is_some()).count(),
      "composite fetch resolved"
    );
    Ok(CompositeResult { primary, slots })
  }
}

/// A resolved composite: the primary value plus one value per auxiliary slot,
/// either fetched or defaulted.
pub struct CompositeResult<P> {
  pub primary: P,
  slots: BTreeMap<String, AuxSlot>,
}

impl<P> CompositeResult<P> {
  /// Borrow an auxiliary value. `None` if the slot does not exist or holds
  /// another type.
  pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
    self.slots.get(name)?.value.downcast_ref::<T>()
  }

  /// Move an auxiliary value out of the result.
  pub fn take<T: 'static>(&mut self, name: &str) -> Option<T> {
    if !self.slots.get(name)?.value.is::<T>() {
      return None;
    }
    let slot = self.slots.remove(name)?;
    slot.value.downcast::<T>().ok().map(|boxed| *boxed)
  }

  /// True if the slot fell back to its default.
  pub fn is_degraded(&self, name: &str) -> bool {
    self
      .slots
      .get(name)
      .map(|slot| slot.fallback.is_some())
      .unwrap_or(false)
  }

  /// Every slot that fell back to its default, with the error that caused it.
  pub fn degraded(&self) -> Vec<(&str, &TransportError)> {
    self
      .slots
      .iter()
      .filter_map(|(name, slot)| slot.fallback.as_ref().map(|err| (name.as_str(), err)))
      .collect()
  }

  pub fn slot_names(&self) -> impl Iterator<Item = &str> {
    self.slots.keys().map(String::as_str)
  }
}

impl<P: std::fmt::Debug> std::fmt::Debug for CompositeResult<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompositeResult")
      .field("primary", &self.primary)
      .field("slots", &self.slots.keys().collect::<Vec<_>>())
      .field("degraded", &self.degraded())
      .finish()
  }
}
