//! Long-running server jobs and the controller that polls them to completion.

mod poller;
mod types;

pub use poller::{JobFetcher, JobPoller, PollState, DEFAULT_POLL_INTERVAL};
pub use types::{Job, JobStatus};
