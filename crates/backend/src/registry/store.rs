//! Durable checkpoint of the device registry.
//!
//! The checkpoint is indented JSON with sorted keys. Every save writes a
//! temporary file in the same directory, syncs it and renames it over the
//! checkpoint, so readers only ever see a complete file. The directory is
//! synced after the rename.

use std::{
  collections::BTreeMap,
  fs::{self, File},
  io::{self, Write},
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::domain::device::{Device, StreamRecord};

/// Persisted registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
  /// Key: device id
  #[serde(default)]
  pub devices: BTreeMap<String, Device>,
  /// Key: stream name
  #[serde(default)]
  pub streams: BTreeMap<String, StreamRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("checkpoint I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("checkpoint encoding error: {0}")]
  Serde(#[from] serde_json::Error),
}

impl StoreError {
  fn io(path: &Path, source: io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Debug, Clone)]
pub struct StateStore {
  path: PathBuf,
}

impl StateStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn temp_path(&self) -> PathBuf {
    let name = self
      .path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "state.json".to_string());
    self.path.with_file_name(format!(".{name}.tmp"))
  }

  /// Read the checkpoint; `None` when it has never been written
  pub fn load(&self) -> Result<Option<PersistentState>, StoreError> {
    let content = match fs::read(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = %self.path.display(), "No checkpoint yet");
        return Ok(None);
      }
      Err(e) => return Err(StoreError::io(&self.path, e)),
    };
    Ok(Some(serde_json::from_slice(&content)?))
  }

  /// Atomically replace the checkpoint with `state`
  pub fn save(&self, state: &PersistentState) -> Result<(), StoreError> {
    let mut json = serde_json::to_vec_pretty(state)?;
    json.push(b'\n');

    let temp = self.temp_path();
    let result = write_synced(&temp, &json).and_then(|()| fs::rename(&temp, &self.path));
    if let Err(e) = result {
      if let Err(cleanup) = fs::remove_file(&temp)
        && cleanup.kind() != io::ErrorKind::NotFound
      {
        warn!(path = %temp.display(), error = %cleanup, "Failed to remove temporary checkpoint");
      }
      return Err(StoreError::io(&self.path, e));
    }
    // the rename is only durable once the directory entry is
    let dir = match self.path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    File::open(dir)
      .and_then(|d| d.sync_all())
      .map_err(|e| StoreError::io(dir, e))?;

    trace!(path = %self.path.display(), bytes = json.len(), "Checkpoint written");
    Ok(())
  }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
  let mut file = File::create(path)?;
  file.write_all(data)?;
  file.sync_all()
}
