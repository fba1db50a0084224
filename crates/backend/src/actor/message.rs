//! Stream actor message types
//!
//! Every request carries a `oneshot` sender for its single reply. Errors
//! cross the boundary as `(ErrorKind, message)` so replies stay `Clone`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
  domain::filesystem::FileSystem,
  error::{ErrorKind, UnpackerError},
  sync::UpdateStats,
};

/// Unique identifier for a request (for correlation in logs)
pub type RequestId = String;

// ============================================================================
// Stream Actor Messages
// ============================================================================

/// A message sent to a StreamActor
#[derive(Debug)]
pub struct StreamActorMessage {
  /// Request ID for correlation
  pub id: RequestId,
  pub reply: oneshot::Sender<StreamActorResponse>,
  pub payload: StreamActorPayload,
}

#[derive(Debug, Clone)]
pub enum StreamActorPayload {
  /// Move the stream onto a device; `None` allocates any unused device
  Associate { device_id: Option<String> },
  /// Mount and scan the stream's filesystem
  Scan { skip_if_scanned: bool },
  /// Make the scanned filesystem match `desired`
  Unpack {
    image_name: String,
    desired: Arc<FileSystem>,
  },
  PrepareForCapture,
  PrepareForCopy,
  Export { export_type: String, destination: String },
  Shutdown,
}

impl StreamActorPayload {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Associate { .. } => "associate",
      Self::Scan { .. } => "scan",
      Self::Unpack { .. } => "unpack",
      Self::PrepareForCapture => "prepare_for_capture",
      Self::PrepareForCopy => "prepare_for_copy",
      Self::Export { .. } => "export",
      Self::Shutdown => "shutdown",
    }
  }
}

/// What an unpack did to the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackReport {
  pub image_name: String,
  /// Files deleted because the image has no use for their content
  pub deleted: usize,
  pub fetched_objects: usize,
  pub fetched_bytes: u64,
  pub update: UpdateStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReply {
  Done,
  Associated { device_id: String },
  Unpacked(UnpackReport),
  ShuttingDown,
}

/// Response from a StreamActor
#[derive(Debug, Clone)]
pub enum StreamActorResponse {
  Done(StreamReply),
  Error { kind: ErrorKind, message: String },
}

impl StreamActorResponse {
  pub fn from_result(result: Result<StreamReply, UnpackerError>) -> Self {
    match result {
      Ok(reply) => Self::Done(reply),
      Err(e) => Self::Error {
        kind: e.kind(),
        message: e.to_string(),
      },
    }
  }

  pub fn into_result(self) -> Result<StreamReply, UnpackerError> {
    match self {
      Self::Done(reply) => Ok(reply),
      Self::Error { kind, message } => Err(UnpackerError::Stream { kind, message }),
    }
  }
}
