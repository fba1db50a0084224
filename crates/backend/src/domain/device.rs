//! Block devices and the persisted half of stream records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A block device known to the unpacker.
///
/// Only the identity and assignment are persisted; the size is read from
/// the OS whenever the device is loaded or discovered.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
  /// Kernel name of the device (`sdb`, `nvme1n1`, ...)
  pub device_name: String,
  #[serde(skip)]
  pub size_bytes: u64,
  /// Stream this device is assigned to
  #[serde(default)]
  pub assigned_stream: Option<String>,
  #[serde(default)]
  pub partitioned_at: Option<DateTime<Utc>>,
}

impl Device {
  pub fn new(device_name: impl Into<String>, size_bytes: u64) -> Self {
    Self {
      device_name: device_name.into(),
      size_bytes,
      assigned_stream: None,
      partitioned_at: None,
    }
  }

  pub fn is_assigned(&self) -> bool {
    self.assigned_stream.is_some()
  }
}

/// Persisted stream fields
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
  #[serde(default)]
  pub assigned_device: Option<String>,
}
