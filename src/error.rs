//! Error types for the synchronization core.

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
  /// A fetch or mutation failed on the wire.
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// A mutation succeeded remotely but one of its declared prefixes could not
  /// be resolved to a concrete key.
  #[error("mutation '{mutation}' cannot resolve its invalidation prefixes: {reason}")]
  StaleMutation { mutation: String, reason: String },

  /// A key segment or mutation argument is not JSON-representable.
  #[error("value is not serializable: {0}")]
  Serialization(String),

  #[error("mutation '{0}' has no registered invalidation rule")]
  UnregisteredMutation(String),

  #[error("mutation '{0}' is already registered")]
  DuplicateMutation(String),

  /// Cached data does not decode into the requested type.
  #[error("cached payload does not match the requested type: {0}")]
  Payload(String),

  #[error("query cache has been disposed")]
  Disposed,
}

impl Error {
  pub(crate) fn serialization(err: serde_json::Error) -> Self {
    Self::Serialization(err.to_string())
  }

  pub(crate) fn payload(err: serde_json::Error) -> Self {
    Self::Payload(err.to_string())
  }
}
