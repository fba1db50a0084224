//! Top-level error type for unpacker operations.

use serde::{Deserialize, Serialize};

use crate::{
  domain::stream::StatusError,
  host::HostError,
  image::ImageError,
  registry::{RegistryError, StoreError},
  sync::SyncError,
};

/// Coarse error category, stable across the actor and IPC boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Validation,
  NotFound,
  Conflict,
  InvalidState,
  Host,
  Workflow,
  Persistence,
  Image,
  ActorGone,
  Cancelled,
}

impl ErrorKind {
  /// Error codes follow JSON-RPC conventions:
  /// - `-32602`: Invalid params
  /// - `-32001`: Unknown stream or device
  /// - `-32002`: Conflict with registry state
  /// - `-32003`: Operation not allowed in the stream's current phase
  /// - `-32000`: Server error (all other errors)
  pub fn code(self) -> i32 {
    match self {
      Self::Validation => -32602,
      Self::NotFound => -32001,
      Self::Conflict => -32002,
      Self::InvalidState => -32003,
      _ => -32000,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum UnpackerError {
  #[error("Validation error: {0}")]
  Validation(String),
  #[error("{0}")]
  NotFound(String),
  #[error("{0}")]
  Conflict(String),
  #[error(transparent)]
  InvalidState(#[from] StatusError),
  #[error(transparent)]
  Host(#[from] HostError),
  #[error(transparent)]
  Workflow(#[from] SyncError),
  #[error("Persistence error: {0}")]
  Persistence(#[from] StoreError),
  #[error(transparent)]
  Image(#[from] ImageError),
  #[error("Stream actor has shut down")]
  ActorGone,
  #[error("Operation cancelled")]
  Cancelled,
  /// An error reported by a stream actor
  #[error("{message}")]
  Stream { kind: ErrorKind, message: String },
}

impl UnpackerError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::Validation,
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::Conflict(_) => ErrorKind::Conflict,
      Self::InvalidState(_) => ErrorKind::InvalidState,
      Self::Host(_) => ErrorKind::Host,
      Self::Workflow(_) => ErrorKind::Workflow,
      Self::Persistence(_) => ErrorKind::Persistence,
      Self::Image(ImageError::Cancelled) => ErrorKind::Cancelled,
      Self::Image(_) => ErrorKind::Image,
      Self::ActorGone => ErrorKind::ActorGone,
      Self::Cancelled => ErrorKind::Cancelled,
      Self::Stream { kind, .. } => *kind,
    }
  }

  /// Get the IPC error code for this error.
  pub fn code(&self) -> i32 {
    self.kind().code()
  }

  pub fn unknown_stream(name: &str) -> Self {
    Self::NotFound(format!("unknown stream: {name}"))
  }
}

impl From<RegistryError> for UnpackerError {
  fn from(err: RegistryError) -> Self {
    match err {
      RegistryError::DeviceNotFound(_) | RegistryError::StreamNotFound(_) => Self::NotFound(err.to_string()),
      RegistryError::Persist(e) => Self::Persistence(e),
      RegistryError::DuplicateId(_)
      | RegistryError::DeviceNameInUse { .. }
      | RegistryError::DeviceAssigned { .. }
      | RegistryError::StreamHasDevice { .. }
      | RegistryError::NoAvailableDevice => Self::Conflict(err.to_string()),
    }
  }
}
