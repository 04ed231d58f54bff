//! The narrow contract with whatever performs the actual network calls.
//!
//! The core never talks to a network itself. A fetcher is any closure that
//! produces a future resolving to a value or a [`TransportError`].

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the transport layer during a fetch or mutation.
///
/// Cloneable so a single failure can be handed to every reader joined on the
/// same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  /// The request never produced a response (connection refused, timeout, ...)
  #[error("network error: {0}")]
  Network(String),
  /// The server answered with a failure status
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },
  /// The response body could not be decoded
  #[error("decode error: {0}")]
  Decode(String),
}

impl TransportError {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network(message.into())
  }

  pub fn server(status: u16, message: impl Into<String>) -> Self {
    Self::Server {
      status,
      message: message.into(),
    }
  }
}

impl From<serde_json::Error> for TransportError {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

/// Boxed future produced by a type-erased fetcher.
pub type FetchFuture = BoxFuture<'static, Result<Value, TransportError>>;

/// A factory producing fetch futures. Kept by the cache so that invalidated
/// entries with live subscribers can be refetched without the caller.
pub type FetcherFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;
