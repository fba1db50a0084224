//! The Unpacker facade - the public operation surface.
//!
//! Registry-only operations (device discovery, removal, status reads) are
//! handled here under the shared lock. Everything that touches a stream's
//! filesystem is posted to that stream's actor and the reply awaited.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  actor::{
    StreamEnv, StreamRouter,
    handle::StreamHandle,
    lifecycle::activity::KeepAlive,
    message::{StreamActorPayload, StreamReply, UnpackReport},
  },
  domain::{config::Config, device::Device, filesystem::FileSystem},
  error::UnpackerError,
  host::{Host, HostError},
  image::{self, ImageSource, ObjectFetcher},
  registry::{Registry, StateStore},
  state::{SharedState, SharedStateRef, StreamStatusInfo},
};

// ============================================================================
// Results
// ============================================================================

/// A device as reported to clients, including its OS-reported size
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
  pub device_name: String,
  pub size_bytes: u64,
  pub assigned_stream: Option<String>,
  pub partitioned_at: Option<DateTime<Utc>>,
}

impl From<&Device> for DeviceStatus {
  fn from(device: &Device) -> Self {
    Self {
      device_name: device.device_name.clone(),
      size_bytes: device.size_bytes,
      assigned_stream: device.assigned_stream.clone(),
      partitioned_at: device.partitioned_at,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackerStatus {
  pub devices: BTreeMap<String, DeviceStatus>,
  pub streams: BTreeMap<String, StreamStatusInfo>,
  pub time_since_last_activity_ms: u64,
}

impl UnpackerStatus {
  pub fn time_since_last_activity(&self) -> Duration {
    Duration::from_millis(self.time_since_last_activity_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDeviceResult {
  pub device_id: String,
  pub device_name: String,
  pub size_bytes: u64,
  pub root_label: String,
}

// ============================================================================
// Unpacker
// ============================================================================

pub struct Unpacker {
  shared: SharedStateRef,
  router: StreamRouter,
  host: Host,
  images: Arc<dyn ImageSource>,
  config: Arc<Config>,
  activity: KeepAlive,
  /// Block devices seen by the last `prepare_for_add_device`
  discovery: Mutex<Option<BTreeSet<String>>>,
  cancel: CancellationToken,
  next_request: AtomicU64,
}

impl Unpacker {
  /// Restore the registry from the checkpoint and start an actor for every
  /// known stream. Device sizes are re-read from the OS.
  pub async fn load(
    config: Config,
    host: Host,
    images: Arc<dyn ImageSource>,
    objects: Arc<dyn ObjectFetcher>,
    cancel: CancellationToken,
  ) -> Result<Self, UnpackerError> {
    let mount_root = config.unpacker.mount_root();
    tokio::fs::create_dir_all(&mount_root)
      .await
      .map_err(|e| HostError::io(format!("creating {}", mount_root.display()), e))?;

    let mut registry = Registry::open(StateStore::new(config.unpacker.state_file()))?;
    let devices: Vec<(String, String)> = registry
      .devices()
      .iter()
      .map(|(id, device)| (id.clone(), device.device_name.clone()))
      .collect();
    for (id, device_name) in devices {
      match host.devices.size(&device_name).await {
        Ok(size) => registry.set_device_size(&id, size),
        Err(e) => warn!(device_id = %id, device = %device_name, error = %e, "Unable to read device size"),
      }
    }
    for problem in registry.check_invariants() {
      warn!(problem = %problem, "Registry invariant violated after load");
    }
    let streams: Vec<String> = registry.streams().keys().cloned().collect();

    let config = Arc::new(config);
    let shared = SharedState::new(registry);
    let env = StreamEnv {
      shared: Arc::clone(&shared),
      host: host.clone(),
      objects,
      config: Arc::clone(&config),
    };
    let router = StreamRouter::new(env, cancel.child_token());
    for stream in &streams {
      router.get_or_create(stream).await;
    }

    info!(
      streams = streams.len(),
      state_dir = %config.unpacker.state_dir.display(),
      "Unpacker loaded"
    );

    Ok(Self {
      shared,
      router,
      host,
      images,
      config,
      activity: KeepAlive::new(),
      discovery: Mutex::new(None),
      cancel,
      next_request: AtomicU64::new(1),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  // ==========================================================================
  // Devices
  // ==========================================================================

  /// Remember the block devices visible now. Returns how many there are.
  pub async fn prepare_for_add_device(&self) -> Result<usize, UnpackerError> {
    self.activity.touch().await;
    let visible = self.host.devices.list().await?;
    let count = visible.len();
    *self.discovery.lock().await = Some(visible);
    info!(visible = count, "Prepared for add device");
    Ok(count)
  }

  /// Record the one device that appeared since `prepare_for_add_device`,
  /// after partitioning and formatting it.
  pub async fn add_device(&self, device_id: &str) -> Result<AddDeviceResult, UnpackerError> {
    self.activity.touch().await;
    validate_name("device ID", device_id)?;
    if self.shared.read().await.registry.device(device_id).is_some() {
      return Err(UnpackerError::Conflict(format!("device ID: {device_id} already exists")));
    }

    let mut discovery = self.discovery.lock().await;
    let Some(before) = discovery.as_ref() else {
      return Err(UnpackerError::Validation(
        "no device discovery in progress: prepare for add device first".to_string(),
      ));
    };
    let visible = self.host.devices.list().await?;
    let new: Vec<&String> = visible.difference(before).collect();
    let device_name = match new.as_slice() {
      [] => return Err(UnpackerError::Conflict("no new devices found".to_string())),
      [name] => (*name).clone(),
      _ => return Err(UnpackerError::Conflict("too many new devices found".to_string())),
    };

    self.shared.read().await.registry.check_device_name(&device_name)?;

    let size_bytes = self.host.devices.size(&device_name).await?;
    let device_node = self.host.devices.device_node(&device_name);
    info!(device_id = %device_id, device = %device_node.display(), size_bytes, "Partitioning new device");
    let root_label = self.host.partitioner.partition_and_format(&device_node).await?;

    let device = Device {
      partitioned_at: Some(Utc::now()),
      ..Device::new(device_name.clone(), size_bytes)
    };
    self.shared.write().await.registry.add_device(device_id, device)?;
    *discovery = None;
    self.activity.touch().await;

    info!(device_id = %device_id, device = %device_name, root_label = %root_label, "Device added");
    Ok(AddDeviceResult {
      device_id: device_id.to_string(),
      device_name,
      size_bytes,
      root_label,
    })
  }

  /// Forget an unassigned device
  pub async fn remove_device(&self, device_id: &str) -> Result<(), UnpackerError> {
    self.activity.touch().await;
    let device = self.shared.write().await.registry.remove_device(device_id)?;
    info!(device_id = %device_id, device = %device.device_name, "Device removed");
    Ok(())
  }

  // ==========================================================================
  // Stream workflows
  // ==========================================================================

  /// Move a stream onto a device; an empty id picks any unused device.
  /// Returns the stream's device.
  pub async fn associate_stream_with_device(&self, stream: &str, device_id: &str) -> Result<String, UnpackerError> {
    self.activity.touch().await;
    let handle = self.setup_stream(stream).await?;
    let device_id = (!device_id.is_empty()).then(|| device_id.to_string());
    match self.dispatch(&handle, StreamActorPayload::Associate { device_id }).await? {
      StreamReply::Associated { device_id } => Ok(device_id),
      other => Err(unexpected_reply("associate", &other)),
    }
  }

  /// Mount and scan the stream's device, allocating one if needed.
  ///
  /// With `do_not_wait` the call returns once the request is queued; the
  /// outcome is only logged.
  pub async fn prepare_for_unpack(
    &self,
    stream: &str,
    skip_if_scanned: bool,
    do_not_wait: bool,
  ) -> Result<(), UnpackerError> {
    self.activity.touch().await;
    let handle = self.setup_stream(stream).await?;
    let payload = StreamActorPayload::Scan { skip_if_scanned };
    if !do_not_wait {
      self.dispatch(&handle, payload).await?;
      return Ok(());
    }

    let rx = handle.send(self.request_id(payload.name()), payload)?;
    let stream = stream.to_string();
    tokio::spawn(async move {
      match rx.await.map(|response| response.into_result()) {
        Ok(Ok(_)) => debug!(stream = %stream, "Background prepare for unpack completed"),
        Ok(Err(e)) => warn!(stream = %stream, error = %e, "Background prepare for unpack failed"),
        Err(_) => debug!(stream = %stream, "Stream actor stopped before replying"),
      }
    });
    Ok(())
  }

  pub async fn prepare_for_capture(&self, stream: &str) -> Result<(), UnpackerError> {
    self.activity.touch().await;
    let handle = self.existing_stream(stream).await?;
    self.dispatch(&handle, StreamActorPayload::PrepareForCapture).await?;
    Ok(())
  }

  pub async fn prepare_for_copy(&self, stream: &str) -> Result<(), UnpackerError> {
    self.activity.touch().await;
    let handle = self.existing_stream(stream).await?;
    self.dispatch(&handle, StreamActorPayload::PrepareForCopy).await?;
    Ok(())
  }

  /// Wait for `stream/leaf` to be available on the image server, then make
  /// the stream's scanned filesystem match it.
  pub async fn unpack_image(&self, stream: &str, image_leaf: &str) -> Result<UnpackReport, UnpackerError> {
    self.activity.touch().await;
    let handle = self.existing_stream(stream).await?;
    validate_name("image name", image_leaf)?;
    let image_name = format!("{stream}/{image_leaf}");

    let image = image::wait_for_image(&self.images, &image_name, &self.config.image, &self.cancel).await?;
    image
      .file_system
      .validate()
      .map_err(|e| UnpackerError::Validation(format!("image {image_name}: {e}")))?;

    let payload = StreamActorPayload::Unpack {
      image_name,
      desired: Arc::new(image.file_system),
    };
    match self.dispatch(&handle, payload).await? {
      StreamReply::Unpacked(report) => Ok(report),
      other => Err(unexpected_reply("unpack", &other)),
    }
  }

  pub async fn export_image(&self, stream: &str, export_type: &str, destination: &str) -> Result<(), UnpackerError> {
    self.activity.touch().await;
    validate_name("export type", export_type)?;
    let handle = self.setup_stream(stream).await?;
    let payload = StreamActorPayload::Export {
      export_type: export_type.to_string(),
      destination: destination.to_string(),
    };
    self.dispatch(&handle, payload).await?;
    Ok(())
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Snapshot of devices and streams; never waits on a stream workflow
  pub async fn get_status(&self) -> UnpackerStatus {
    let idle = self.activity.idle_duration().await;
    let shared = self.shared.read().await;
    let devices = shared
      .registry
      .devices()
      .iter()
      .map(|(id, device)| (id.clone(), DeviceStatus::from(device)))
      .collect();
    let streams = shared
      .registry
      .streams()
      .keys()
      .filter_map(|name| shared.stream_status(name).map(|status| (name.clone(), status)))
      .collect();
    UnpackerStatus {
      devices,
      streams,
      time_since_last_activity_ms: idle.as_millis() as u64,
    }
  }

  /// The stream's last scan, if it has one that has not been consumed
  pub async fn get_file_system(&self, stream: &str) -> Result<Option<Arc<FileSystem>>, UnpackerError> {
    let shared = self.shared.read().await;
    if shared.registry.stream(stream).is_none() {
      return Err(UnpackerError::unknown_stream(stream));
    }
    Ok(shared.views.get(stream).and_then(|view| view.file_system.clone()))
  }

  /// Stop every stream actor after its queued requests complete
  pub async fn shutdown(&self) {
    self.router.shutdown_all().await;
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  /// Create the stream record if needed and get its actor
  async fn setup_stream(&self, stream: &str) -> Result<StreamHandle, UnpackerError> {
    validate_stream_name(stream)?;
    let created = self.shared.write().await.registry.ensure_stream(stream)?;
    if created {
      info!(stream = %stream, "Stream created");
    }
    Ok(self.router.get_or_create(stream).await)
  }

  async fn existing_stream(&self, stream: &str) -> Result<StreamHandle, UnpackerError> {
    if self.shared.read().await.registry.stream(stream).is_none() {
      return Err(UnpackerError::unknown_stream(stream));
    }
    Ok(self.router.get_or_create(stream).await)
  }

  async fn dispatch(&self, handle: &StreamHandle, payload: StreamActorPayload) -> Result<StreamReply, UnpackerError> {
    let id = self.request_id(payload.name());
    let response = handle.request(id, payload).await;
    self.activity.touch().await;
    response?.into_result()
  }

  fn request_id(&self, op: &str) -> String {
    format!("{op}-{}", self.next_request.fetch_add(1, Ordering::Relaxed))
  }
}

fn validate_name(what: &str, value: &str) -> Result<(), UnpackerError> {
  if value.is_empty() {
    return Err(UnpackerError::Validation(format!("{what} must not be empty")));
  }
  if value.chars().any(char::is_control) {
    return Err(UnpackerError::Validation(format!("{what} contains control characters")));
  }
  Ok(())
}

/// Stream names are `/`-separated paths without empty, `.` or `..` parts
fn validate_stream_name(stream: &str) -> Result<(), UnpackerError> {
  validate_name("stream name", stream)?;
  if stream.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
    return Err(UnpackerError::Validation(format!("invalid stream name: {stream}")));
  }
  Ok(())
}

fn unexpected_reply(op: &str, reply: &StreamReply) -> UnpackerError {
  UnpackerError::Stream {
    kind: crate::error::ErrorKind::Workflow,
    message: format!("unexpected reply to {op}: {reply:?}"),
  }
}
