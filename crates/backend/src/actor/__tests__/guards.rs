//! Status guards exercised on a StreamActor directly.
//!
//! Requests to one stream are serialized, so a request can never observe
//! another request's in-progress phase through the queue. These tests put
//! the actor into such a phase by hand.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;
  use tokio::sync::oneshot;
  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      __tests__::helpers::UnpackerTestContext,
      message::{StreamActorMessage, StreamActorPayload, StreamActorResponse},
      stream::StreamActor,
    },
    domain::{
      filesystem::{FileSystem, Inode, ObjectHash, RegularInode},
      stream::StreamStatus,
    },
    error::ErrorKind,
    registry::{Registry, StateStore},
    state::{SharedState, SharedStateRef},
  };

  async fn actor(ctx: &UnpackerTestContext) -> (StreamActor, SharedStateRef) {
    let registry = Registry::new(StateStore::new(ctx.config.unpacker.state_file()));
    let shared = SharedState::new(registry);
    shared.write().await.registry.ensure_stream("db1").unwrap();
    let (actor, _handle) = StreamActor::new("db1".to_string(), ctx.env(shared.clone()), CancellationToken::new()).await;
    (actor, shared)
  }

  #[tokio::test]
  async fn test_new_actor_without_device() {
    let ctx = UnpackerTestContext::new();
    let (actor, shared) = actor(&ctx).await;
    assert_eq!(actor.status, StreamStatus::NoDevice);
    assert_eq!(shared.read().await.views["db1"].status, StreamStatus::NoDevice);
  }

  #[tokio::test]
  async fn test_export_rejected_while_scanning() {
    let ctx = UnpackerTestContext::new();
    let (mut actor, shared) = actor(&ctx).await;
    actor.set_status(StreamStatus::Scanning).await;

    let err = actor.export("aws", "ami-db1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.to_string(), "stream scan in progress");
    assert_eq!(actor.status, StreamStatus::Scanning);
    assert_eq!(shared.read().await.views["db1"].status, StreamStatus::Scanning);
    assert!(ctx.exporter.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_busy_phases_reject_every_workflow() {
    let ctx = UnpackerTestContext::new();
    let (mut actor, _shared) = actor(&ctx).await;

    for busy in [
      StreamStatus::Fetching,
      StreamStatus::Updating,
      StreamStatus::Preparing,
      StreamStatus::Exporting,
    ] {
      actor.set_status(busy).await;
      assert!(actor.scan(false).await.is_err(), "scan during {busy}");
      assert!(actor.associate(None).await.is_err(), "associate during {busy}");
      assert!(actor.prepare_for_copy().await.is_err(), "copy during {busy}");
      assert!(actor.prepare_for_capture().await.is_err(), "capture during {busy}");
      assert_eq!(actor.status, busy);
    }
    assert_eq!(ctx.mounter.mounts.load(std::sync::atomic::Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_errors_cross_the_reply_channel() {
    let ctx = UnpackerTestContext::new();
    let (mut actor, _shared) = actor(&ctx).await;
    actor.set_status(StreamStatus::Exporting).await;

    let (tx, rx) = oneshot::channel();
    let keep_running = actor
      .handle_message(StreamActorMessage {
        id: "req-1".to_string(),
        reply: tx,
        payload: StreamActorPayload::Scan { skip_if_scanned: false },
      })
      .await;
    assert!(keep_running);

    match rx.await.unwrap() {
      StreamActorResponse::Error { kind, message } => {
        assert_eq!(kind, ErrorKind::InvalidState);
        assert_eq!(message, "export in progress");
      }
      other => panic!("Unexpected response: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_shutdown_stops_the_actor() {
    let ctx = UnpackerTestContext::new();
    let (mut actor, _shared) = actor(&ctx).await;

    let (tx, rx) = oneshot::channel();
    let keep_running = actor
      .handle_message(StreamActorMessage {
        id: "shutdown".to_string(),
        reply: tx,
        payload: StreamActorPayload::Shutdown,
      })
      .await;
    assert!(!keep_running);
    assert!(matches!(rx.await.unwrap(), StreamActorResponse::Done(_)));
  }

  #[tokio::test]
  async fn test_failed_delete_returns_to_mounted() {
    let ctx = UnpackerTestContext::new();
    let (mut actor, shared) = actor(&ctx).await;

    // the scan lists a stale file but the mount point is gone
    let mut scanned = FileSystem::new();
    scanned.insert(
      "stale",
      2,
      Inode::Regular(RegularInode {
        mode: 0o644,
        uid: 0,
        gid: 0,
        size: 5,
        mtime: 0,
        hash: Some(ObjectHash::of(b"stale")),
      }),
    );
    actor.file_system = Some(Arc::new(scanned));
    actor.set_status(StreamStatus::Scanned).await;
    assert!(!ctx.mount_point("db1").exists());

    let result = actor.unpack("db1/v1", Arc::new(FileSystem::new())).await;

    assert!(result.is_err());
    assert_eq!(actor.status, StreamStatus::Mounted);
    assert!(actor.file_system.is_none());
    assert_eq!(shared.read().await.views["db1"].status, StreamStatus::Mounted);
  }
}
