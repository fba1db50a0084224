//! Device registry - the shared table of devices and stream assignments.
//!
//! The registry is plain data plus invariant checks; callers hold it behind
//! the process-wide `RwLock`. Every mutation is checkpointed before it
//! returns. If the checkpoint cannot be written the mutation is rolled back,
//! so memory never runs ahead of disk.

mod store;

use tracing::{debug, info, warn};

pub use store::{PersistentState, StateStore, StoreError};

use crate::domain::device::{Device, StreamRecord};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("unknown device ID: {0}")]
  DeviceNotFound(String),
  #[error("unknown stream: {0}")]
  StreamNotFound(String),
  #[error("device ID: {0} already exists")]
  DuplicateId(String),
  #[error("device {device_name} already registered as: {id}")]
  DeviceNameInUse { device_name: String, id: String },
  #[error("device ID: {id} used by: {stream}")]
  DeviceAssigned { id: String, stream: String },
  #[error("stream {stream} already has device: {device}")]
  StreamHasDevice { stream: String, device: String },
  #[error("no available device")]
  NoAvailableDevice,
  #[error("failed to persist registry: {0}")]
  Persist(#[from] StoreError),
}

#[derive(Debug)]
pub struct Registry {
  state: PersistentState,
  store: StateStore,
}

impl Registry {
  /// An empty registry checkpointed to `store`
  pub fn new(store: StateStore) -> Self {
    Self {
      state: PersistentState::default(),
      store,
    }
  }

  /// Load the registry from its checkpoint, or start empty when there is none.
  ///
  /// Dangling or one-sided assignments found in the checkpoint are repaired
  /// in memory and logged.
  pub fn open(store: StateStore) -> Result<Self, RegistryError> {
    let state = store.load()?.unwrap_or_default();
    let mut registry = Self { state, store };
    registry.repair();
    info!(
      devices = registry.state.devices.len(),
      streams = registry.state.streams.len(),
      path = %registry.store.path().display(),
      "Registry loaded"
    );
    Ok(registry)
  }

  fn repair(&mut self) {
    let PersistentState { devices, streams } = &mut self.state;
    for (id, device) in devices.iter() {
      if let Some(stream) = &device.assigned_stream {
        let record = streams.entry(stream.clone()).or_insert_with(|| {
          warn!(device_id = %id, stream = %stream, "Device names unknown stream, recreating it");
          StreamRecord::default()
        });
        if record.assigned_device.as_deref() != Some(id.as_str()) {
          warn!(device_id = %id, stream = %stream, "Stream did not point back at its device, fixing");
          record.assigned_device = Some(id.clone());
        }
      }
    }
    for (name, record) in streams.iter_mut() {
      let Some(id) = &record.assigned_device else {
        continue;
      };
      let linked = devices
        .get(id)
        .is_some_and(|d| d.assigned_stream.as_deref() == Some(name.as_str()));
      if !linked {
        warn!(stream = %name, device_id = %id, "Stream names a device it does not own, clearing");
        record.assigned_device = None;
      }
    }
  }

  // ========================================================================
  // Reads
  // ========================================================================

  pub fn devices(&self) -> &std::collections::BTreeMap<String, Device> {
    &self.state.devices
  }

  pub fn streams(&self) -> &std::collections::BTreeMap<String, StreamRecord> {
    &self.state.streams
  }

  pub fn device(&self, id: &str) -> Option<&Device> {
    self.state.devices.get(id)
  }

  pub fn stream(&self, name: &str) -> Option<&StreamRecord> {
    self.state.streams.get(name)
  }

  /// The device assigned to `stream`, with its id
  pub fn device_of(&self, stream: &str) -> Option<(&str, &Device)> {
    let id = self.stream(stream)?.assigned_device.as_deref()?;
    self.state.devices.get_key_value(id).map(|(k, v)| (k.as_str(), v))
  }

  /// Copy of the persisted state as it stands now
  pub fn snapshot(&self) -> PersistentState {
    self.state.clone()
  }

  /// Describe every broken invariant; empty when the registry is consistent
  pub fn check_invariants(&self) -> Vec<String> {
    let mut problems = Vec::new();
    for (id, device) in &self.state.devices {
      if let Some(stream) = &device.assigned_stream {
        match self.state.streams.get(stream) {
          None => problems.push(format!("device {id} assigned to missing stream {stream}")),
          Some(record) if record.assigned_device.as_deref() != Some(id.as_str()) => {
            problems.push(format!("stream {stream} does not point back at device {id}"))
          }
          Some(_) => {}
        }
      }
    }
    for (name, record) in &self.state.streams {
      if let Some(id) = &record.assigned_device
        && self.device(id).and_then(|d| d.assigned_stream.as_deref()) != Some(name.as_str())
      {
        problems.push(format!("stream {name} names device {id} which is not assigned to it"));
      }
    }
    problems
  }

  // ========================================================================
  // Mutations
  // ========================================================================

  /// Apply `change` and checkpoint the result, restoring the previous state
  /// if either fails.
  fn commit<T>(
    &mut self,
    change: impl FnOnce(&mut PersistentState) -> Result<T, RegistryError>,
  ) -> Result<T, RegistryError> {
    let before = self.state.clone();
    let value = match change(&mut self.state) {
      Ok(value) => value,
      Err(e) => {
        self.state = before;
        return Err(e);
      }
    };
    if let Err(e) = self.store.save(&self.state) {
      warn!(error = %e, "Checkpoint write failed, rolling back registry change");
      self.state = before;
      return Err(e.into());
    }
    Ok(value)
  }

  /// Create the stream record if it does not exist. Returns true if created.
  pub fn ensure_stream(&mut self, name: &str) -> Result<bool, RegistryError> {
    if self.state.streams.contains_key(name) {
      return Ok(false);
    }
    self.commit(|state| {
      state.streams.insert(name.to_string(), StreamRecord::default());
      Ok(())
    })?;
    debug!(stream = %name, "Stream record created");
    Ok(true)
  }

  pub fn add_device(&mut self, id: &str, device: Device) -> Result<(), RegistryError> {
    if self.state.devices.contains_key(id) {
      return Err(RegistryError::DuplicateId(id.to_string()));
    }
    self.check_device_name(&device.device_name)?;
    let mut device = device;
    device.assigned_stream = None;
    self.commit(|state| {
      state.devices.insert(id.to_string(), device);
      Ok(())
    })
  }

  /// Fails if a registered device already uses `device_name`
  pub fn check_device_name(&self, device_name: &str) -> Result<(), RegistryError> {
    match self.state.devices.iter().find(|(_, d)| d.device_name == device_name) {
      Some((existing, _)) => Err(RegistryError::DeviceNameInUse {
        device_name: device_name.to_string(),
        id: existing.clone(),
      }),
      None => Ok(()),
    }
  }

  /// Forget a device. Only unassigned devices can be removed.
  pub fn remove_device(&mut self, id: &str) -> Result<Device, RegistryError> {
    let device = self
      .device(id)
      .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
    if let Some(stream) = &device.assigned_stream {
      return Err(RegistryError::DeviceAssigned {
        id: id.to_string(),
        stream: stream.clone(),
      });
    }
    self.commit(|state| {
      state
        .devices
        .remove(id)
        .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))
    })
  }

  /// Assign an unassigned device to a stream that has none
  pub fn assign(&mut self, id: &str, stream: &str) -> Result<(), RegistryError> {
    self.commit(|state| link(state, id, stream))
  }

  /// Release a device from its stream, if it has one
  pub fn unassign(&mut self, id: &str) -> Result<(), RegistryError> {
    let device = self
      .device(id)
      .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
    if device.assigned_stream.is_none() {
      return Ok(());
    }
    self.commit(|state| {
      unlink(state, id);
      Ok(())
    })
  }

  /// Move `stream` onto device `id`, releasing its previous device in the
  /// same checkpoint. Returns the released device id.
  pub fn reassign(&mut self, stream: &str, id: &str) -> Result<Option<String>, RegistryError> {
    let record = self
      .stream(stream)
      .ok_or_else(|| RegistryError::StreamNotFound(stream.to_string()))?;
    if record.assigned_device.as_deref() == Some(id) {
      return Ok(None);
    }
    let previous = record.assigned_device.clone();
    self.commit(|state| {
      if let Some(previous) = &previous {
        unlink(state, previous);
      }
      link(state, id, stream)?;
      Ok(previous)
    })
  }

  /// Assign the lowest-id unused device to `stream`
  pub fn allocate(&mut self, stream: &str) -> Result<String, RegistryError> {
    let id = self
      .state
      .devices
      .iter()
      .find(|(_, d)| !d.is_assigned())
      .map(|(id, _)| id.clone())
      .ok_or(RegistryError::NoAvailableDevice)?;
    self.assign(&id, stream)?;
    info!(stream = %stream, device_id = %id, "Allocated unused device");
    Ok(id)
  }

  /// Record the size the OS reports for a device (not persisted)
  pub fn set_device_size(&mut self, id: &str, size_bytes: u64) {
    if let Some(device) = self.state.devices.get_mut(id) {
      device.size_bytes = size_bytes;
    }
  }
}

fn link(state: &mut PersistentState, id: &str, stream: &str) -> Result<(), RegistryError> {
  let record = state
    .streams
    .get(stream)
    .ok_or_else(|| RegistryError::StreamNotFound(stream.to_string()))?;
  if let Some(device) = &record.assigned_device {
    return Err(RegistryError::StreamHasDevice {
      stream: stream.to_string(),
      device: device.clone(),
    });
  }
  let device = state
    .devices
    .get_mut(id)
    .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
  if let Some(owner) = &device.assigned_stream {
    return Err(RegistryError::DeviceAssigned {
      id: id.to_string(),
      stream: owner.clone(),
    });
  }
  device.assigned_stream = Some(stream.to_string());
  if let Some(record) = state.streams.get_mut(stream) {
    record.assigned_device = Some(id.to_string());
  }
  Ok(())
}

fn unlink(state: &mut PersistentState, id: &str) {
  let Some(device) = state.devices.get_mut(id) else {
    return;
  };
  if let Some(stream) = device.assigned_stream.take()
    && let Some(record) = state.streams.get_mut(&stream)
  {
    record.assigned_device = None;
  }
}
