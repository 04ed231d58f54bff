//! Synchronization core for keeping a local mirror of server-owned state
//! correct and fresh.
//!
//! - [`key`]: structural query keys and prefix matching
//! - [`cache`]: the keyed query cache with shared in-flight fetches
//! - [`composite`]: primary + degradable auxiliary fetches
//! - [`invalidation`]: the declared blast radius of every mutation
//! - [`jobs`]: polling long-running server jobs to a terminal status

pub mod cache;
pub mod composite;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod jobs;
pub mod key;
pub mod transport;

pub use cache::{CacheConfig, Entry, QueryCache, QueryStatus, ReadOptions, Subscription};
pub use composite::{CompositeFetch, CompositeResult};
pub use error::{Error, Result};
pub use invalidation::{InvalidationGraph, Prefix};
pub use jobs::{Job, JobPoller, JobStatus, PollState};
pub use key::QueryKey;
pub use transport::TransportError;
