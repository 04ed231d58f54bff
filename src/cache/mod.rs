//! In-memory query cache mirroring server-owned state.
//!
//! This module provides a transport-agnostic cache that:
//! - Stores one entry per structural [`QueryKey`](crate::key::QueryKey)
//! - Keeps at most one fetch in flight per key; concurrent readers share it
//! - Serves previous data while revalidating stale entries
//! - Notifies subscribers of every status transition, in transition order
//! - Drops entries nobody subscribes to after a GC delay

mod entry;
mod policy;
mod store;
mod subscription;

pub use entry::{Entry, QueryStatus};
pub use policy::{CacheConfig, KeyPolicy, ReadOptions};
pub use store::{Callback, QueryCache};
pub use subscription::Subscription;
