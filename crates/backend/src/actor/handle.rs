//! Handle for communicating with a stream actor
//!
//! Handles are cheap to clone. Each request gets its own reply channel.

use tokio::sync::{mpsc, oneshot};

use super::message::{StreamActorMessage, StreamActorPayload, StreamActorResponse};

/// Handle to communicate with a StreamActor
///
/// The queue is unbounded so posting a request never waits on a workflow
/// that is already running.
#[derive(Clone, Debug)]
pub struct StreamHandle {
  pub tx: mpsc::UnboundedSender<StreamActorMessage>,
}

impl StreamHandle {
  pub fn new(tx: mpsc::UnboundedSender<StreamActorMessage>) -> Self {
    Self { tx }
  }

  /// Enqueue a request and get the receiver for its reply
  pub fn send(
    &self,
    id: String,
    payload: StreamActorPayload,
  ) -> Result<oneshot::Receiver<StreamActorResponse>, SendError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let msg = StreamActorMessage {
      id,
      reply: reply_tx,
      payload,
    };
    self.tx.send(msg).map_err(|_| SendError::ActorGone)?;
    Ok(reply_rx)
  }

  /// Enqueue a request and wait for its reply
  pub async fn request(&self, id: String, payload: StreamActorPayload) -> Result<StreamActorResponse, SendError> {
    let rx = self.send(id, payload)?;
    rx.await.map_err(|_| SendError::ActorGone)
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to an actor
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}

impl From<SendError> for crate::error::UnpackerError {
  fn from(_: SendError) -> Self {
    Self::ActorGone
  }
}
