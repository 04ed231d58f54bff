//! Declared blast radius of every mutation.
//!
//! Each mutation registers, ahead of time, the key prefixes it makes stale.
//! Prefixes may contain placeholders filled from the mutation's arguments, so
//! `create_task { product_id: "p1" }` can stale `["tasks", "p1"]`.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::transport::TransportError;

/// One segment of a prefix template
#[derive(Debug, Clone, PartialEq)]
pub enum PrefixSegment {
  Literal(Value),
  /// Filled from the mutation arguments: a top-level field name, or a JSON
  /// pointer when it starts with `/`
  Arg(String),
}

/// A key prefix, possibly parameterized by mutation arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Prefix {
  segments: Vec<PrefixSegment>,
}

impl Prefix {
  pub fn new(root: impl Into<String>) -> Self {
    Self {
      segments: vec![PrefixSegment::Literal(Value::String(root.into()))],
    }
  }

  pub fn lit(mut self, segment: impl Into<Value>) -> Self {
    self.segments.push(PrefixSegment::Literal(segment.into()));
    self
  }

  pub fn arg(mut self, path: impl Into<String>) -> Self {
    self.segments.push(PrefixSegment::Arg(path.into()));
    self
  }

  pub fn segments(&self) -> &[PrefixSegment] {
    &self.segments
  }

  /// Fill placeholders from `args`. A missing or null argument fails.
  pub fn resolve(&self, mutation: &str, args: &Value) -> Result<QueryKey> {
    let mut resolved = Vec::with_capacity(self.segments.len());
    for segment in &self.segments {
      match segment {
        PrefixSegment::Literal(value) => resolved.push(value.clone()),
        PrefixSegment::Arg(path) => {
          let found = if path.starts_with('/') {
            args.pointer(path)
          } else {
            args.get(path)
          };
          match found {
            Some(value) if !value.is_null() => resolved.push(value.clone()),
            _ => {
              return Err(Error::StaleMutation {
                mutation: mutation.to_string(),
                reason: format!("missing argument '{}'", path),
              })
            }
          }
        }
      }
    }
    Ok(QueryKey::from_segments(resolved))
  }
}

impl From<QueryKey> for Prefix {
  fn from(key: QueryKey) -> Self {
    Self {
      segments: key
        .segments()
        .iter()
        .cloned()
        .map(PrefixSegment::Literal)
        .collect(),
    }
  }
}

/// Registry from mutation id to the prefixes it invalidates.
#[derive(Debug, Clone, Default)]
pub struct InvalidationGraph {
  rules: HashMap<String, Vec<Prefix>>,
}

impl InvalidationGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare the blast radius of `mutation`. An empty list is a valid
  /// declaration; registering the same id twice is an error.
  pub fn register(&mut self, mutation: impl Into<String>, prefixes: Vec<Prefix>) -> Result<()> {
    let mutation = mutation.into();
    if self.rules.contains_key(&mutation) {
      return Err(Error::DuplicateMutation(mutation));
    }
    self.rules.insert(mutation, prefixes);
    Ok(())
  }

  /// Builder form of [`register`](Self::register).
  pub fn with(mut self, mutation: impl Into<String>, prefixes: Vec<Prefix>) -> Result<Self> {
    self.register(mutation, prefixes)?;
    Ok(self)
  }

  pub fn is_registered(&self, mutation: &str) -> bool {
    self.rules.contains_key(mutation)
  }

  pub fn prefixes_for(&self, mutation: &str) -> Option<&[Prefix]> {
    self.rules.get(mutation).map(Vec::as_slice)
  }

  /// Concrete prefixes for one mutation call, without touching any cache.
  pub fn resolve<A: Serialize + ?Sized>(&self, mutation: &str, args: &A) -> Result<Vec<QueryKey>> {
    let templates = self
      .rules
      .get(mutation)
      .ok_or_else(|| Error::UnregisteredMutation(mutation.to_string()))?;
    let args = serde_json::to_value(args).map_err(Error::serialization)?;
    templates
      .iter()
      .map(|template| template.resolve(mutation, &args))
      .collect()
  }

  /// Invalidate everything `mutation` declared. Call once, after the
  /// mutation is confirmed successful.
  ///
  /// Every prefix is resolved before the first invalidation, so a missing
  /// argument leaves the cache untouched.
  pub fn apply<A: Serialize + ?Sized>(
    &self,
    cache: &QueryCache,
    mutation: &str,
    args: &A,
  ) -> Result<Vec<QueryKey>> {
    let prefixes = self.resolve(mutation, args)?;
    let mut marked = 0;
    for prefix in &prefixes {
      marked += cache.invalidate_prefix(prefix)?;
    }
    info!(mutation, prefixes = prefixes.len(), marked, "applied invalidation");
    Ok(prefixes)
  }

  /// Run a mutation and apply its invalidation before reporting success.
  ///
  /// Unregistered mutations are rejected before `remote` is polled. A failed
  /// mutation invalidates nothing.
  pub async fn mutate<A, T, Fut>(
    &self,
    cache: &QueryCache,
    mutation: &str,
    args: &A,
    remote: Fut,
  ) -> Result<T>
  where
    A: Serialize + ?Sized,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
  {
    if !self.is_registered(mutation) {
      return Err(Error::UnregisteredMutation(mutation.to_string()));
    }
    debug!(mutation, "mutation started");
    let value = remote.await?;
    self.apply(cache, mutation, args)?;
    Ok(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{QueryStatus, ReadOptions};
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn graph() -> InvalidationGraph {
    InvalidationGraph::new()
      .with("create_task", vec![Prefix::new("tasks").arg("product_id")])
      .unwrap()
      .with(
        "move_task",
        vec![
          Prefix::new("tasks").arg("/from/product"),
          Prefix::new("tasks").arg("/to/product"),
          Prefix::new("task").arg("task_id"),
        ],
      )
      .unwrap()
      .with("rename_profile", vec![])
      .unwrap()
  }

  async fn seed(cache: &QueryCache, keys: &[QueryKey]) {
    for key in keys {
      cache
        .fetch(key, || async { Ok::<_, TransportError>(json!([])) }, ReadOptions::default())
        .await
        .unwrap();
    }
  }

  fn invalidated(cache: &QueryCache, key: &QueryKey) -> bool {
    cache.get(key).unwrap().unwrap().is_invalidated
  }

  #[test]
  fn test_resolve_arguments() {
    let graph = graph();
    let keys = graph
      .resolve(
        "move_task",
        &json!({"task_id": 9, "from": {"product": "p1"}, "to": {"product": "p2"}}),
      )
      .unwrap();
    assert_eq!(
      keys,
      vec![
        QueryKey::root("tasks").with("p1"),
        QueryKey::root("tasks").with("p2"),
        QueryKey::root("task").with(9),
      ]
    );
  }

  #[test]
  fn test_missing_argument_is_stale_mutation() {
    let err = graph()
      .resolve("create_task", &json!({"title": "x"}))
      .unwrap_err();
    assert!(matches!(err, Error::StaleMutation { ref mutation, .. } if mutation == "create_task"));

    let err = graph()
      .resolve("create_task", &json!({"product_id": null}))
      .unwrap_err();
    assert!(matches!(err, Error::StaleMutation { .. }));
  }

  #[test]
  fn test_registration_rules() {
    let mut graph = graph();
    assert!(graph.is_registered("rename_profile"));
    assert_eq!(graph.prefixes_for("rename_profile"), Some(&[][..]));
    assert!(matches!(
      graph.register("create_task", vec![]),
      Err(Error::DuplicateMutation(_))
    ));
    assert!(matches!(
      graph.resolve("delete_everything", &json!({})),
      Err(Error::UnregisteredMutation(_))
    ));
  }

  #[tokio::test]
  async fn test_apply_stales_descendants_only() {
    let cache = QueryCache::default();
    let p1 = QueryKey::root("tasks").with("p1");
    let drafts = QueryKey::root("tasks").with("p1").with("drafts");
    let p2 = QueryKey::root("tasks").with("p2");
    seed(&cache, &[p1.clone(), drafts.clone(), p2.clone()]).await;

    graph()
      .apply(&cache, "create_task", &json!({"product_id": "p1"}))
      .unwrap();

    assert!(invalidated(&cache, &p1));
    assert!(invalidated(&cache, &drafts));
    assert!(!invalidated(&cache, &p2));
  }

  #[tokio::test]
  async fn test_apply_is_all_or_nothing() {
    let cache = QueryCache::default();
    let p1 = QueryKey::root("tasks").with("p1");
    seed(&cache, &[p1.clone()]).await;

    // from resolves, to does not
    let err = graph()
      .apply(&cache, "move_task", &json!({"task_id": 1, "from": {"product": "p1"}}))
      .unwrap_err();
    assert!(matches!(err, Error::StaleMutation { .. }));
    assert!(!invalidated(&cache, &p1));
  }

  #[tokio::test]
  async fn test_mutate_invalidates_before_returning() {
    let cache = QueryCache::default();
    let key = QueryKey::root("tasks").with("p1");
    let refetches = Arc::new(AtomicU32::new(0));
    let counter = refetches.clone();
    cache
      .fetch(
        &key,
        move || {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Ok::<_, TransportError>(json!([])) }
        },
        ReadOptions::default(),
      )
      .await
      .unwrap();
    let _sub = cache.subscribe(&key, |_| {}).unwrap();

    let created = graph()
      .mutate(&cache, "create_task", &json!({"product_id": "p1"}), async {
        Ok::<_, TransportError>("t-42")
      })
      .await
      .unwrap();

    assert_eq!(created, "t-42");
    // The subscribed entry is already refetching when success is reported
    let entry = cache.get(&key).unwrap().unwrap();
    assert_eq!(entry.status, QueryStatus::Loading);
    assert!(entry.is_invalidated);
  }

  #[tokio::test]
  async fn test_failed_mutation_invalidates_nothing() {
    let cache = QueryCache::default();
    let key = QueryKey::root("tasks").with("p1");
    seed(&cache, &[key.clone()]).await;

    let err = graph()
      .mutate(&cache, "create_task", &json!({"product_id": "p1"}), async {
        Err::<(), _>(TransportError::server(409, "conflict"))
      })
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert!(!invalidated(&cache, &key));
  }

  #[tokio::test]
  async fn test_unregistered_mutation_never_runs() {
    let cache = QueryCache::default();
    let ran = Arc::new(AtomicU32::new(0));
    let counter = ran.clone();

    let err = graph()
      .mutate(&cache, "archive_product", &json!({}), async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, TransportError>(())
      })
      .await
      .unwrap_err();

    assert!(matches!(err, Error::UnregisteredMutation(_)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
  }
}
