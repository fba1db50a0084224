//! StreamRouter - Routes requests to StreamActors, spawning them on demand
//!
//! The router maps stream names to their `StreamActor` handles. It uses
//! `DashMap` for lock-free lookups and resolves the race where two requests
//! try to spawn the same stream at once.
//!
//! # Usage
//!
//! ```ignore
//! let router = StreamRouter::new(env, cancel_token);
//! let handle = router.get_or_create("db1").await;
//! let response = handle.request("req-1".to_string(), payload).await?;
//! ```

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  handle::StreamHandle,
  message::StreamActorPayload,
  stream::{StreamActor, StreamEnv},
};

// ============================================================================
// StreamRouter
// ============================================================================

/// Routes requests to StreamActors, spawning them on demand
///
/// # Lifecycle
///
/// - Actors are spawned lazily on first access via `get_or_create`, or
///   eagerly for streams restored from the checkpoint
/// - Each actor gets a child `CancellationToken` for coordinated shutdown
/// - `shutdown_all` terminates every actor (used during daemon shutdown)
pub struct StreamRouter {
  /// Active stream actors, keyed by stream name
  streams: DashMap<String, StreamHandle>,

  /// Collaborators handed to every actor
  env: StreamEnv,

  /// Parent cancellation token
  ///
  /// Each spawned StreamActor gets a child token. When this token is
  /// cancelled, all stream actors will shut down.
  cancel: CancellationToken,
}

impl StreamRouter {
  pub fn new(env: StreamEnv, cancel: CancellationToken) -> Self {
    Self {
      streams: DashMap::new(),
      env,
      cancel,
    }
  }

  /// Get or create the StreamActor for `name`
  ///
  /// The stream record must already exist in the registry. Calling this
  /// concurrently for a new stream spawns at most one surviving actor.
  pub async fn get_or_create(&self, name: &str) -> StreamHandle {
    // Fast path: actor already exists
    if let Some(handle) = self.streams.get(name)
      && !handle.is_closed()
    {
      debug!(stream = %name, "Reusing existing StreamActor");
      return handle.value().clone();
    }

    let handle = StreamActor::spawn(name.to_string(), self.env.clone(), self.cancel.child_token()).await;

    // Using entry API to handle race condition - if another task inserted
    // while we were spawning, use their handle instead
    match self.streams.entry(name.to_string()) {
      dashmap::mapref::entry::Entry::Occupied(mut existing) => {
        if existing.get().is_closed() {
          existing.insert(handle.clone());
          handle
        } else {
          // Our spawned actor will shut down when its handle is dropped
          warn!(stream = %name, "Race condition: using existing StreamActor");
          existing.get().clone()
        }
      }
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        vacant.insert(handle.clone());
        handle
      }
    }
  }

  /// Names of all active streams
  pub fn list(&self) -> Vec<String> {
    self.streams.iter().map(|entry| entry.key().clone()).collect()
  }

  /// Ask one stream's actor to stop once its queued requests are done
  pub async fn shutdown_stream(&self, name: &str) {
    if let Some((_, handle)) = self.streams.remove(name) {
      info!(stream = %name, "Shutting down StreamActor");
      match handle.send(format!("shutdown-{name}"), StreamActorPayload::Shutdown) {
        Ok(rx) => {
          let _ = rx.await;
        }
        Err(e) => debug!(stream = %name, error = %e, "Failed to send shutdown (actor may already be stopped)"),
      }
    }
  }

  /// Shutdown all active streams concurrently
  pub async fn shutdown_all(&self) {
    let names = self.list();
    if names.is_empty() {
      return;
    }

    info!(count = names.len(), "Shutting down all StreamActors");
    let futures: Vec<_> = names.iter().map(|name| self.shutdown_stream(name)).collect();
    futures::future::join_all(futures).await;
    info!("All StreamActors shut down");
  }
}
