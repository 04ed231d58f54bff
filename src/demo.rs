//! In-memory dashboard backend and a scripted session against it.
//!
//! The backend stands in for the transport: every call sleeps briefly and
//! answers from process memory. `run_session` wires it through the cache, the
//! invalidation graph, a composite detail fetch and the job poller.

use color_eyre::{eyre::eyre, Result};
use dashsync::{
  CompositeFetch, Entry, InvalidationGraph, Job, JobPoller, JobStatus, PollState, Prefix,
  QueryCache, QueryKey, QueryStatus, ReadOptions, TransportError,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

const LATENCY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub product_id: String,
  pub title: String,
}

/// What the product detail panel renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
  pub product: Product,
  pub tasks: Vec<Task>,
  pub activity: Vec<String>,
  /// Auxiliary slots that fell back to their defaults
  #[serde(default)]
  pub degraded: Vec<String>,
}

struct ExportJob {
  product_id: String,
  polls_left: u32,
  status: JobStatus,
  exported: usize,
}

#[derive(Default)]
struct BackendState {
  products: HashMap<String, Product>,
  tasks: HashMap<String, Vec<Task>>,
  jobs: HashMap<String, ExportJob>,
  next_id: u32,
}

/// Simulated server owning products, tasks and export jobs.
pub struct Backend {
  state: Mutex<BackendState>,
  /// Polls an export job spends in each active status
  job_steps: u32,
  /// Make the activity feed fail, to exercise degraded detail panels
  fail_activity: bool,
}

impl Backend {
  pub fn seeded(job_steps: u32, fail_activity: bool) -> Self {
    let mut state = BackendState::default();
    for (id, name) in [("p1", "Storefront"), ("p2", "Billing")] {
      state.products.insert(
        id.to_string(),
        Product {
          id: id.to_string(),
          name: name.to_string(),
        },
      );
      state.tasks.insert(id.to_string(), Vec::new());
    }
    Self {
      state: Mutex::new(state),
      job_steps,
      fail_activity,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
    self
      .state
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  pub async fn get_product(&self, id: &str) -> Result<Product, TransportError> {
    tokio::time::sleep(LATENCY).await;
    self
      .lock()
      .products
      .get(id)
      .cloned()
      .ok_or_else(|| TransportError::server(404, format!("product {} not found", id)))
  }

  pub async fn list_tasks(&self, product_id: &str) -> Result<Vec<Task>, TransportError> {
    tokio::time::sleep(LATENCY).await;
    Ok(
      self
        .lock()
        .tasks
        .get(product_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  pub async fn list_activity(&self, product_id: &str) -> Result<Vec<String>, TransportError> {
    tokio::time::sleep(LATENCY).await;
    if self.fail_activity {
      return Err(TransportError::server(502, "activity service unavailable"));
    }
    let count = self.lock().tasks.get(product_id).map(Vec::len).unwrap_or(0);
    Ok(vec![format!("{} has {} task(s)", product_id, count)])
  }

  pub async fn create_task(&self, product_id: &str, title: &str) -> Result<Task, TransportError> {
    tokio::time::sleep(LATENCY).await;
    let mut state = self.lock();
    if !state.products.contains_key(product_id) {
      return Err(TransportError::server(404, format!("product {} not found", product_id)));
    }
    state.next_id += 1;
    let task = Task {
      id: format!("t{}", state.next_id),
      product_id: product_id.to_string(),
      title: title.to_string(),
    };
    state
      .tasks
      .entry(product_id.to_string())
      .or_default()
      .push(task.clone());
    Ok(task)
  }

  pub async fn start_export(&self, product_id: &str) -> Result<Job, TransportError> {
    tokio::time::sleep(LATENCY).await;
    let mut state = self.lock();
    state.next_id += 1;
    let id = format!("export-{}", state.next_id);
    state.jobs.insert(
      id.clone(),
      ExportJob {
        product_id: product_id.to_string(),
        polls_left: self.job_steps,
        status: JobStatus::Pending,
        exported: 0,
      },
    );
    Ok(Job::new(id, JobStatus::Pending))
  }

  /// A job spends `job_steps` polls pending, as many running, then succeeds.
  pub async fn get_job(&self, id: &str) -> Result<Job, TransportError> {
    tokio::time::sleep(LATENCY).await;
    let mut state = self.lock();
    let BackendState { jobs, tasks, .. } = &mut *state;
    let job = jobs
      .get_mut(id)
      .ok_or_else(|| TransportError::server(404, format!("job {} not found", id)))?;

    if job.polls_left > 0 {
      job.polls_left -= 1;
    } else {
      match job.status {
        JobStatus::Pending => {
          job.status = JobStatus::Running;
          job.polls_left = self.job_steps;
        }
        JobStatus::Running => {
          job.status = JobStatus::Succeeded;
          job.exported = tasks.get(&job.product_id).map(Vec::len).unwrap_or(0);
        }
        _ => {}
      }
    }

    let reported = Job::new(id, job.status);
    Ok(match job.status {
      JobStatus::Succeeded => reported.with_result(json!({ "exported": job.exported })),
      _ => reported,
    })
  }
}

/// Outcome of a scripted session
#[derive(Debug)]
pub struct Summary {
  pub detail: ProductDetail,
  pub tasks_after_create: Vec<Task>,
  pub export: Job,
  pub transitions: Vec<QueryStatus>,
}

pub fn detail_key(product_id: &str) -> QueryKey {
  QueryKey::root("product").with(product_id).with("detail")
}

pub fn tasks_key(product_id: &str) -> QueryKey {
  QueryKey::root("tasks").with(product_id)
}

pub fn invalidation_graph() -> dashsync::Result<InvalidationGraph> {
  InvalidationGraph::new()
    .with(
      "create_task",
      vec![
        Prefix::new("tasks").arg("product_id"),
        Prefix::new("product").arg("product_id"),
      ],
    )?
    .with("start_export", vec![Prefix::new("job")])
}

/// Load the detail panel, create a task, then export and poll the job.
pub async fn run_session(
  cache: &QueryCache,
  backend: Arc<Backend>,
  poll_interval: Duration,
) -> Result<Summary> {
  let graph = invalidation_graph()?;
  let product_id = "p1";

  let detail_entry = cache
    .fetch(&detail_key(product_id), detail_fetcher(&backend, product_id), ReadOptions::default())
    .await?;
  let detail: ProductDetail = decode_success(&detail_entry)?;
  info!(
    product = %detail.product.name,
    tasks = detail.tasks.len(),
    degraded = ?detail.degraded,
    "detail panel loaded"
  );

  // Watch the task list while mutating it
  let tasks = tasks_key(product_id);
  let (tx, mut rx) = mpsc::unbounded_channel();
  let _subscription = cache.subscribe(&tasks, move |entry: &Entry| {
    let _ = tx.send(entry.status);
  })?;
  cache
    .fetch(&tasks, tasks_fetcher(&backend, product_id), ReadOptions::default())
    .await?;

  let args = json!({ "product_id": product_id, "title": "Ship the new checkout" });
  let created = graph
    .mutate(cache, "create_task", &args, {
      let backend = Arc::clone(&backend);
      async move { backend.create_task(product_id, "Ship the new checkout").await }
    })
    .await?;
  info!(task = %created.id, "task created");

  // Invalidation refetched the subscribed list; wait for it to land
  let mut transitions = Vec::new();
  while let Some(status) = rx.recv().await {
    transitions.push(status);
    if transitions.len() >= 4 && status != QueryStatus::Loading {
      break;
    }
  }
  let tasks_after_create: Vec<Task> = decode_success(
    &cache
      .get(&tasks)?
      .ok_or_else(|| eyre!("task list vanished from the cache"))?,
  )?;

  let started = graph
    .mutate(cache, "start_export", &json!({}), {
      let backend = Arc::clone(&backend);
      async move { backend.start_export(product_id).await }
    })
    .await?;

  let job_backend = Arc::clone(&backend);
  let mut poller = JobPoller::new(cache.clone(), move |id: String| {
    let backend = Arc::clone(&job_backend);
    async move { backend.get_job(&id).await }
  })
  .with_interval(poll_interval);
  let mut states = poller.watch();
  poller.bind(started.id.clone());

  let export = loop {
    let state = states.borrow_and_update().clone();
    match state {
      PollState::Settled { job, .. } => break job,
      PollState::Polling { job, last_error, .. } => {
        info!(
          job = %started.id,
          status = ?job.map(|j| j.status),
          error = ?last_error,
          "export in progress"
        );
      }
      PollState::Idle => {}
    }
    states.changed().await?;
  };
  poller.unbind();
  info!(job = %export.id, status = ?export.status, "export finished");

  Ok(Summary {
    detail,
    tasks_after_create,
    export,
    transitions,
  })
}

fn detail_fetcher(
  backend: &Arc<Backend>,
  product_id: &str,
) -> impl Fn() -> BoxFuture<'static, Result<ProductDetail, TransportError>>
     + Send
     + Sync
     + 'static {
  let backend = Arc::clone(backend);
  let product_id = product_id.to_string();
  move || {
    let composite = detail_composite(&backend, &product_id);
    async move {
      let mut result = composite.run().await?;
      let degraded = result
        .degraded()
        .into_iter()
        .map(|(name, _)| name.to_string())
        .collect();
      Ok::<_, TransportError>(ProductDetail {
        tasks: result.take("tasks").unwrap_or_default(),
        activity: result.take("activity").unwrap_or_default(),
        degraded,
        product: result.primary,
      })
    }
    .boxed()
  }
}

fn detail_composite(backend: &Arc<Backend>, product_id: &str) -> CompositeFetch<Product> {
  let (b1, b2, b3) = (Arc::clone(backend), Arc::clone(backend), Arc::clone(backend));
  let (id1, id2, id3) = (
    product_id.to_string(),
    product_id.to_string(),
    product_id.to_string(),
  );
  CompositeFetch::new(move || async move { b1.get_product(&id1).await })
    .auxiliary(
      "tasks",
      move || async move { b2.list_tasks(&id2).await },
      Vec::<Task>::new(),
    )
    .auxiliary(
      "activity",
      move || async move { b3.list_activity(&id3).await },
      Vec::<String>::new(),
    )
}

fn tasks_fetcher(
  backend: &Arc<Backend>,
  product_id: &str,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<Task>, TransportError>>
     + Send
     + Sync
     + 'static {
  let backend = Arc::clone(backend);
  let product_id = product_id.to_string();
  move || {
    let backend = Arc::clone(&backend);
    let product_id = product_id.clone();
    async move { backend.list_tasks(&product_id).await }.boxed()
  }
}

fn decode_success<T: serde::de::DeserializeOwned>(entry: &Entry) -> Result<T> {
  if let Some(err) = &entry.error {
    return Err(eyre!("{} failed: {}", entry.key, err));
  }
  entry
    .decode::<T>()?
    .ok_or_else(|| eyre!("{} has no data", entry.key))
}
