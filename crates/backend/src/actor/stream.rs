//! StreamActor - Per-stream actor that owns the stream's runtime state
//!
//! The actor is the only writer of its stream's status, scanned filesystem
//! and object cache. Requests are processed one at a time in arrival order,
//! so no two workflow steps for a stream ever overlap. Status changes are
//! mirrored into the shared [`StreamView`](crate::state::StreamView) so
//! status reads never wait on a running step.
//!
//! # Lifecycle
//!
//! The actor runs until one of:
//! - The CancellationToken is triggered
//! - A `StreamActorPayload::Shutdown` message is received
//! - The request channel is closed
//!
//! A stream that is still mounted when the actor stops is unmounted.

use std::{
  collections::BTreeSet,
  path::PathBuf,
  sync::Arc,
  time::Instant,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  handle::StreamHandle,
  message::{StreamActorMessage, StreamActorPayload, StreamActorResponse, StreamReply},
};
use crate::{
  domain::{
    config::Config,
    device::Device,
    filesystem::{FileSystem, ObjectHash},
    stream::{StreamOp, StreamStatus},
  },
  error::UnpackerError,
  host::{Host, HostError},
  image::ObjectFetcher,
  registry::RegistryError,
  state::SharedStateRef,
  sync::{self, ObjectCache, scanner},
};

/// Prefix of root filesystem labels written when a device is formatted
pub const ROOT_LABEL_PREFIX: &str = "rootfs@";

// ============================================================================
// Configuration
// ============================================================================

/// Collaborators shared by every stream actor
#[derive(Clone)]
pub struct StreamEnv {
  pub shared: SharedStateRef,
  pub host: Host,
  pub objects: Arc<dyn ObjectFetcher>,
  pub config: Arc<Config>,
}

impl StreamEnv {
  /// Mount point for a stream. Stream names may contain `/`.
  pub fn mount_point(&self, stream: &str) -> PathBuf {
    self.config.unpacker.mount_root().join(stream.replace('/', "%2F"))
  }
}

// ============================================================================
// StreamActor
// ============================================================================

pub struct StreamActor {
  pub(super) name: String,
  pub(super) env: StreamEnv,
  pub(super) mount_point: PathBuf,
  pub(super) status: StreamStatus,
  /// Tree from the last scan; cleared once an unpack consumes it
  pub(super) file_system: Option<Arc<FileSystem>>,
  /// Objects found in the on-device cache by the last scan
  pub(super) object_cache: Option<BTreeSet<ObjectHash>>,
  pub(super) boot_label: Option<String>,
  request_rx: mpsc::UnboundedReceiver<StreamActorMessage>,
  cancel: CancellationToken,
}

impl StreamActor {
  /// Build an actor without starting it. The initial status is derived from
  /// the registry: `NotMounted` with a device, `NoDevice` without.
  pub(super) async fn new(name: String, env: StreamEnv, cancel: CancellationToken) -> (Self, StreamHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let has_device = env.shared.read().await.registry.device_of(&name).is_some();
    let status = if has_device {
      StreamStatus::NotMounted
    } else {
      StreamStatus::NoDevice
    };
    let actor = Self {
      mount_point: env.mount_point(&name),
      name,
      env,
      status,
      file_system: None,
      object_cache: None,
      boot_label: None,
      request_rx: rx,
      cancel,
    };
    actor.publish().await;
    (actor, StreamHandle::new(tx))
  }

  /// Spawn a new StreamActor and return a handle for communication
  pub async fn spawn(name: String, env: StreamEnv, cancel: CancellationToken) -> StreamHandle {
    info!(stream = %name, "Spawning StreamActor");
    let (actor, handle) = Self::new(name, env, cancel).await;
    tokio::spawn(actor.run());
    handle
  }

  /// Main actor event loop
  async fn run(mut self) {
    info!(stream = %self.name, status = %self.status, "StreamActor started");

    if let Some((_, device)) = self.assigned_device().await {
      self.refresh_boot_label(&device).await;
      self.publish().await;
    }

    loop {
      tokio::select! {
        // Check cancellation first (biased)
        biased;

        _ = self.cancel.cancelled() => {
          info!(stream = %self.name, "StreamActor shutting down (cancelled)");
          break;
        }

        msg = self.request_rx.recv() => {
          match msg {
            Some(msg) => {
              if !self.handle_message(msg).await {
                info!(stream = %self.name, "StreamActor shutting down (requested)");
                break;
              }
            }
            None => {
              info!(stream = %self.name, "StreamActor shutting down (channel closed)");
              break;
            }
          }
        }
      }
    }

    self.cleanup().await;
    info!(stream = %self.name, "StreamActor stopped");
  }

  /// Leave the device unmounted so it can be removed or re-associated after
  /// a restart
  async fn cleanup(&mut self) {
    if self.status.is_mounted()
      && let Err(e) = self.unmount().await
    {
      warn!(stream = %self.name, error = %e, "Failed to unmount on shutdown");
    }
  }

  /// Handle one request. Returns false when the actor should stop.
  pub(super) async fn handle_message(&mut self, msg: StreamActorMessage) -> bool {
    let StreamActorMessage { id, reply, payload } = msg;
    let op = payload.name();
    debug!(stream = %self.name, request_id = %id, op, "Handling request");
    let start = Instant::now();

    let result = match payload {
      StreamActorPayload::Associate { device_id } => self
        .associate(device_id.as_deref())
        .await
        .map(|device_id| StreamReply::Associated { device_id }),
      StreamActorPayload::Scan { skip_if_scanned } => self.scan(skip_if_scanned).await.map(|_| StreamReply::Done),
      StreamActorPayload::Unpack { image_name, desired } => {
        self.unpack(&image_name, desired).await.map(StreamReply::Unpacked)
      }
      StreamActorPayload::PrepareForCapture => self.prepare_for_capture().await.map(|_| StreamReply::Done),
      StreamActorPayload::PrepareForCopy => self.prepare_for_copy().await.map(|_| StreamReply::Done),
      StreamActorPayload::Export {
        export_type,
        destination,
      } => self
        .export(&export_type, &destination)
        .await
        .map(|_| StreamReply::Done),
      StreamActorPayload::Shutdown => {
        self.cleanup().await;
        let _ = reply.send(StreamActorResponse::Done(StreamReply::ShuttingDown));
        return false;
      }
    };

    match &result {
      Ok(_) => debug!(
        stream = %self.name,
        request_id = %id,
        op,
        status = %self.status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request completed"
      ),
      Err(e) => warn!(stream = %self.name, request_id = %id, op, status = %self.status, error = %e, "Request failed"),
    }

    if reply.send(StreamActorResponse::from_result(result)).is_err() {
      debug!(stream = %self.name, request_id = %id, "Reply receiver dropped");
    }
    true
  }

  // ==========================================================================
  // Runtime state
  // ==========================================================================

  /// Mirror the runtime fields into the shared view
  pub(super) async fn publish(&self) {
    let mut shared = self.env.shared.write().await;
    let view = shared.views.entry(self.name.clone()).or_default();
    view.status = self.status;
    view.file_system = self.file_system.clone();
    view.boot_label = self.boot_label.clone();
  }

  pub(super) async fn set_status(&mut self, status: StreamStatus) {
    if self.status != status {
      debug!(stream = %self.name, from = %self.status, to = %status, "Status change");
    }
    self.status = status;
    self.publish().await;
  }

  /// Forget the scan results without touching the status
  pub(super) fn clear_scan(&mut self) {
    self.file_system = None;
    self.object_cache = None;
  }

  async fn assigned_device(&self) -> Option<(String, Device)> {
    let shared = self.env.shared.read().await;
    shared
      .registry
      .device_of(&self.name)
      .map(|(id, device)| (id.to_string(), device.clone()))
  }

  /// Read the root filesystem label, keeping it only if we wrote it
  async fn refresh_boot_label(&mut self, device: &Device) {
    let devices = &self.env.host.devices;
    let label = match devices.partition(&device.device_name).await {
      Ok(partition) => devices.label(&partition).await,
      Err(e) => Err(e),
    };
    self.boot_label = match label {
      Ok(label) if label.starts_with(ROOT_LABEL_PREFIX) => Some(label),
      Ok(label) => {
        debug!(stream = %self.name, label = %label, "Ignoring foreign filesystem label");
        None
      }
      Err(e) => {
        debug!(stream = %self.name, error = %e, "Unable to read root label");
        None
      }
    };
  }

  // ==========================================================================
  // Device and mount
  // ==========================================================================

  /// The stream's device, allocating an unused one if it has none
  pub(super) async fn ensure_device(&mut self) -> Result<(String, Device), UnpackerError> {
    if let Some(assigned) = self.assigned_device().await {
      return Ok(assigned);
    }
    let (id, device) = {
      let mut shared = self.env.shared.write().await;
      let id = shared.registry.allocate(&self.name)?;
      let device = shared
        .registry
        .device(&id)
        .cloned()
        .ok_or_else(|| RegistryError::DeviceNotFound(id.clone()))?;
      (id, device)
    };
    self.refresh_boot_label(&device).await;
    self.set_status(StreamStatus::NotMounted).await;
    Ok((id, device))
  }

  /// Mount the device's first partition, creating the object cache
  /// directory. Already-mounted streams are left alone.
  pub(super) async fn mount(&mut self, device: &Device) -> Result<(), UnpackerError> {
    if !self.status.check_mount()? {
      return Ok(());
    }
    let partition = self.env.host.devices.partition(&device.device_name).await?;
    tokio::fs::create_dir_all(&self.mount_point)
      .await
      .map_err(|e| HostError::io(format!("creating {}", self.mount_point.display()), e))?;
    self
      .env
      .host
      .mounter
      .mount(&partition, &self.mount_point, &self.env.config.unpacker.filesystem_type)
      .await?;
    self.set_status(StreamStatus::Mounted).await;
    info!(
      stream = %self.name,
      partition = %partition.display(),
      mount_point = %self.mount_point.display(),
      "Mounted"
    );

    let objects = ObjectCache::for_root(&self.mount_point);
    tokio::fs::create_dir_all(objects.dir())
      .await
      .map_err(|e| HostError::io(format!("creating {}", objects.dir().display()), e))?;
    Ok(())
  }

  pub(super) async fn unmount(&mut self) -> Result<(), UnpackerError> {
    self.env.host.mounter.unmount(&self.mount_point).await?;
    self.clear_scan();
    self.set_status(StreamStatus::NotMounted).await;
    info!(stream = %self.name, mount_point = %self.mount_point.display(), "Unmounted");
    Ok(())
  }

  // ==========================================================================
  // Associate
  // ==========================================================================

  /// Move the stream onto `device_id`, or onto any unused device when
  /// `None`. Returns the device the stream ends up on.
  ///
  /// The target is validated before the current device is unmounted. The
  /// previous device is released but its contents are left as they are.
  pub(super) async fn associate(&mut self, device_id: Option<&str>) -> Result<String, UnpackerError> {
    self.status.check_associate()?;

    {
      let shared = self.env.shared.read().await;
      let current = shared.registry.device_of(&self.name).map(|(id, _)| id);
      match (device_id, current) {
        (Some(id), Some(current)) if id == current => return Ok(id.to_string()),
        (None, Some(current)) => return Ok(current.to_string()),
        (Some(id), _) => {
          let device = shared
            .registry
            .device(id)
            .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
          if let Some(owner) = &device.assigned_stream {
            return Err(
              RegistryError::DeviceAssigned {
                id: id.to_string(),
                stream: owner.clone(),
              }
              .into(),
            );
          }
        }
        (None, None) => {}
      }
    }

    if self.status.is_mounted() {
      self.unmount().await?;
    }

    let (id, previous, device) = {
      let mut shared = self.env.shared.write().await;
      let (id, previous) = match device_id {
        Some(id) => (id.to_string(), shared.registry.reassign(&self.name, id)?),
        None => (shared.registry.allocate(&self.name)?, None),
      };
      let device = shared
        .registry
        .device(&id)
        .cloned()
        .ok_or_else(|| RegistryError::DeviceNotFound(id.clone()))?;
      (id, previous, device)
    };

    self.clear_scan();
    self.refresh_boot_label(&device).await;
    self.set_status(StreamStatus::NotMounted).await;
    info!(
      stream = %self.name,
      device_id = %id,
      previous = previous.as_deref().unwrap_or(""),
      "Associated with device"
    );
    Ok(id)
  }

  // ==========================================================================
  // Scan
  // ==========================================================================

  /// Mount (allocating a device if needed) and scan the filesystem and the
  /// object cache. A failed scan leaves the stream `Mounted`.
  pub(super) async fn scan(&mut self, skip_if_scanned: bool) -> Result<(), UnpackerError> {
    self.status.check_busy(StreamOp::Scan)?;
    let (_, device) = self.ensure_device().await?;
    self.mount(&device).await?;
    if !self.status.check_scan(skip_if_scanned)? {
      debug!(stream = %self.name, "Already scanned, keeping previous scan");
      return Ok(());
    }

    self.clear_scan();
    self.set_status(StreamStatus::Scanning).await;
    let start = Instant::now();
    let root = self.mount_point.clone();
    let result = sync::blocking(move || {
      let file_system = scanner::scan(&root)?;
      let cached = ObjectCache::for_root(&root).scan()?;
      Ok((file_system, cached))
    })
    .await;

    match result {
      Ok((file_system, cached)) => {
        info!(
          stream = %self.name,
          entries = file_system.len(),
          cached_objects = cached.len(),
          elapsed_ms = start.elapsed().as_millis() as u64,
          "Scanned"
        );
        self.file_system = Some(Arc::new(file_system));
        self.object_cache = Some(cached);
        self.set_status(StreamStatus::Scanned).await;
        Ok(())
      }
      Err(e) => {
        self.set_status(StreamStatus::Mounted).await;
        Err(e.into())
      }
    }
  }
}
