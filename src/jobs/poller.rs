//! Job polling controller.
//!
//! `Idle` (nothing bound) -> `Polling` (job bound, status pending/running)
//! -> `Settled` (status succeeded/failed). While polling, the job's cache
//! entry is re-read with a forced refresh every interval. A fetch error keeps
//! polling; only a terminal job status stops it.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::types::Job;
use crate::cache::{QueryCache, QueryStatus, ReadOptions};
use crate::key::QueryKey;
use crate::transport::TransportError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Fetches the current state of one job by id
pub type JobFetcher =
  Arc<dyn Fn(String) -> BoxFuture<'static, Result<Job, TransportError>> + Send + Sync>;

/// Observable state of the controller
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
  /// No job bound
  Idle,
  /// Job bound and still active
  Polling {
    job_id: String,
    /// Last job snapshot seen, if any read succeeded yet
    job: Option<Job>,
    /// Error of the most recent read, cleared by the next successful one
    last_error: Option<TransportError>,
  },
  /// Job reached a terminal status; polling has stopped for good
  Settled { job_id: String, job: Job },
}

impl PollState {
  pub fn job_id(&self) -> Option<&str> {
    match self {
      PollState::Idle => None,
      PollState::Polling { job_id, .. } | PollState::Settled { job_id, .. } => Some(job_id),
    }
  }

  pub fn is_polling(&self) -> bool {
    matches!(self, PollState::Polling { .. })
  }

  pub fn is_settled(&self) -> bool {
    matches!(self, PollState::Settled { .. })
  }
}

/// Per-consumer controller that drives one job to a terminal status.
///
/// Dropping the controller cancels its timer.
pub struct JobPoller {
  cache: QueryCache,
  fetch_job: JobFetcher,
  interval: Duration,
  state: Arc<watch::Sender<PollState>>,
  /// Bumped on every bind/unbind so a cancelled loop cannot publish late
  epoch: Arc<AtomicU64>,
  task: Option<JoinHandle<()>>,
}

impl JobPoller {
  pub fn new<F, Fut>(cache: QueryCache, fetch_job: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Job, TransportError>> + Send + 'static,
  {
    let (state, _) = watch::channel(PollState::Idle);
    Self {
      cache,
      fetch_job: Arc::new(move |id: String| fetch_job(id).boxed()),
      interval: DEFAULT_POLL_INTERVAL,
      state: Arc::new(state),
      epoch: Arc::new(AtomicU64::new(0)),
      task: None,
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Cache key under which a job's status is stored
  pub fn job_key(job_id: &str) -> QueryKey {
    QueryKey::root("job").with(job_id)
  }

  pub fn state(&self) -> PollState {
    self.state.borrow().clone()
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<PollState> {
    self.state.subscribe()
  }

  /// Start polling `job_id` with an immediate read.
  ///
  /// Binding the id that is already bound (polling or settled) does nothing.
  /// Binding another id cancels the current timer first.
  pub fn bind(&mut self, job_id: impl Into<String>) {
    let job_id = job_id.into();
    if self.state.borrow().job_id() == Some(job_id.as_str()) {
      return;
    }

    self.cancel();
    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    self.state.send_replace(PollState::Polling {
      job_id: job_id.clone(),
      job: None,
      last_error: None,
    });
    debug!(job = %job_id, "job bound");

    let job_loop = PollLoop {
      cache: self.cache.clone(),
      fetch_job: Arc::clone(&self.fetch_job),
      interval: self.interval,
      state: Arc::clone(&self.state),
      current_epoch: Arc::clone(&self.epoch),
      epoch,
      job_id,
    };
    self.task = Some(tokio::spawn(job_loop.run()));
  }

  /// Cancel the timer unconditionally and return to `Idle`.
  pub fn unbind(&mut self) {
    self.cancel();
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.state.send_replace(PollState::Idle);
  }

  fn cancel(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl Drop for JobPoller {
  fn drop(&mut self) {
    self.cancel();
  }
}

struct PollLoop {
  cache: QueryCache,
  fetch_job: JobFetcher,
  interval: Duration,
  state: Arc<watch::Sender<PollState>>,
  current_epoch: Arc<AtomicU64>,
  epoch: u64,
  job_id: String,
}

/// Forced, and without cache-level retry: a failed read waits for the next
/// interval like any other poll.
fn read_options() -> ReadOptions {
  ReadOptions::forced().with_retry(0)
}

impl PollLoop {
  async fn run(self) {
    let key = JobPoller::job_key(&self.job_id);
    let traced_id = self.job_id.clone();
    // Holding a subscription keeps the entry from being collected mid-poll
    let _subscription = match self.cache.subscribe(&key, move |entry| {
      trace!(job = %traced_id, status = ?entry.status, "job entry changed")
    }) {
      Ok(subscription) => subscription,
      Err(err) => {
        warn!(job = %self.job_id, %err, "cannot poll job");
        return;
      }
    };

    let mut last_job = None;
    loop {
      let fetch_job = Arc::clone(&self.fetch_job);
      let job_id = self.job_id.clone();
      let read = self
        .cache
        .fetch(&key, move || fetch_job(job_id.clone()), read_options())
        .await;

      let entry = match read {
        Ok(entry) => entry,
        Err(err) => {
          warn!(job = %self.job_id, %err, "job cache unavailable, polling stopped");
          return;
        }
      };

      let last_error = match (entry.status, entry.decode::<Job>()) {
        (QueryStatus::Success, Ok(Some(job))) if job.status.is_terminal() => {
          info!(job = %self.job_id, status = ?job.status, "job settled");
          self.publish(PollState::Settled {
            job_id: self.job_id.clone(),
            job,
          });
          return;
        }
        (QueryStatus::Success, Ok(Some(job))) => {
          debug!(job = %self.job_id, status = ?job.status, "job still active");
          last_job = Some(job);
          None
        }
        (QueryStatus::Success, Err(err)) => {
          warn!(job = %self.job_id, %err, "job payload did not decode");
          Some(TransportError::Decode(err.to_string()))
        }
        _ => {
          let err = entry
            .error
            .unwrap_or_else(|| TransportError::network("job read did not settle"));
          warn!(job = %self.job_id, %err, "job poll failed, retrying next interval");
          Some(err)
        }
      };

      self.publish(PollState::Polling {
        job_id: self.job_id.clone(),
        job: last_job.clone(),
        last_error,
      });
      tokio::time::sleep(self.interval).await;
    }
  }

  fn publish(&self, state: PollState) {
    if self.current_epoch.load(Ordering::SeqCst) == self.epoch {
      self.state.send_replace(state);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheConfig;
  use crate::jobs::JobStatus;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicU32;
  use std::sync::Mutex;

  type Script = Vec<Result<Job, TransportError>>;

  /// Fetcher replaying `script` in order, repeating the last response
  fn scripted(
    script: Script,
  ) -> (
    Arc<AtomicU32>,
    impl Fn(String) -> BoxFuture<'static, Result<Job, TransportError>> + Send + Sync,
  ) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let queue = Arc::new(Mutex::new(VecDeque::from(script)));
    let fetch = move |_id: String| {
      counter.fetch_add(1, Ordering::SeqCst);
      let mut queue = queue.lock().unwrap();
      let response = if queue.len() > 1 {
        queue.pop_front().unwrap()
      } else {
        queue.front().cloned().unwrap()
      };
      async move { response }.boxed()
    };
    (calls, fetch)
  }

  fn cache() -> QueryCache {
    QueryCache::new(CacheConfig::default().with_retry(0))
  }

  #[tokio::test(start_paused = true)]
  async fn test_polls_until_succeeded() {
    let (calls, fetch) = scripted(vec![
      Ok(Job::new("J1", JobStatus::Pending)),
      Ok(Job::new("J1", JobStatus::Running)),
      Ok(Job::new("J1", JobStatus::Succeeded).with_result(42)),
    ]);
    let mut poller = JobPoller::new(cache(), fetch);

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
      poller.state(),
      PollState::Polling { job: Some(Job { status: JobStatus::Pending, .. }), .. }
    ));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(poller.state().is_polling());

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match poller.state() {
      PollState::Settled { job_id, job } => {
        assert_eq!(job_id, "J1");
        assert_eq!(job.result, Some(serde_json::json!(42)));
      }
      other => panic!("expected settled, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbind_before_first_interval_stops_polling() {
    let (calls, fetch) = scripted(vec![Ok(Job::new("J1", JobStatus::Pending))]);
    let mut poller = JobPoller::new(cache(), fetch);

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    poller.unbind();
    assert_eq!(poller.state(), PollState::Idle);
    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbind_during_failing_read_fetches_no_more() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    // Default cache policy retries failed reads once
    let mut poller = JobPoller::new(QueryCache::default(), move |_id: String| {
      counter.fetch_add(1, Ordering::SeqCst);
      async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err::<Job, _>(TransportError::network("timeout"))
      }
    });

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    poller.unbind();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbind_immediately_fetches_nothing() {
    let (calls, fetch) = scripted(vec![Ok(Job::new("J1", JobStatus::Pending))]);
    let mut poller = JobPoller::new(cache(), fetch);

    poller.bind("J1");
    poller.unbind();
    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_error_keeps_polling() {
    let (calls, fetch) = scripted(vec![
      Err(TransportError::network("timeout")),
      Ok(Job::new("J1", JobStatus::Running)),
      Ok(Job::new("J1", JobStatus::Failed).with_error("out of memory")),
    ]);
    let mut poller = JobPoller::new(cache(), fetch);

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
      poller.state(),
      PollState::Polling {
        job_id: "J1".into(),
        job: None,
        last_error: Some(TransportError::network("timeout")),
      }
    );

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(matches!(
      poller.state(),
      PollState::Polling { last_error: None, job: Some(_), .. }
    ));

    // A failed job is a legitimate terminal state
    tokio::time::sleep(Duration::from_millis(2000)).await;
    match poller.state() {
      PollState::Settled { job, .. } => {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("out of memory"));
      }
      other => panic!("expected settled, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rebinding_settled_job_is_noop() {
    let (calls, fetch) = scripted(vec![Ok(Job::new("J1", JobStatus::Succeeded))]);
    let mut poller = JobPoller::new(cache(), fetch);

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(poller.state().is_settled());

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    poller.bind("J2");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(poller.state().job_id(), Some("J2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_cancels_timer() {
    let (calls, fetch) = scripted(vec![Ok(Job::new("J1", JobStatus::Running))]);
    let mut poller = JobPoller::new(cache(), fetch).with_interval(Duration::from_millis(500));

    poller.bind("J1");
    tokio::time::sleep(Duration::from_millis(1)).await;
    drop(poller);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_watch_observes_settlement() {
    let (_, fetch) = scripted(vec![
      Ok(Job::new("J1", JobStatus::Running)),
      Ok(Job::new("J1", JobStatus::Succeeded).with_result("done")),
    ]);
    let cache = cache();
    let mut poller = JobPoller::new(cache.clone(), fetch);
    let mut rx = poller.watch();

    poller.bind("J1");
    let settled = rx.wait_for(PollState::is_settled).await.unwrap().clone();
    assert_eq!(settled.job_id(), Some("J1"));

    // The controller reads through the cache; the entry holds the final job
    let entry = cache.get(&JobPoller::job_key("J1")).unwrap().unwrap();
    assert_eq!(
      entry.decode::<Job>().unwrap().map(|job| job.status),
      Some(JobStatus::Succeeded)
    );
  }
}
