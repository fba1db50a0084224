//! Stream status state machine.
//!
//! Every workflow step checks the stream's current [`StreamStatus`] before it
//! starts. A step that is not allowed from the current phase returns a
//! [`StatusError`] naming the phase that blocks it and leaves the status
//! untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
  #[default]
  NoDevice,
  NotMounted,
  Mounted,
  Scanning,
  Scanned,
  Fetching,
  Updating,
  Preparing,
  Exporting,
}

impl StreamStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::NoDevice => "no device",
      Self::NotMounted => "not mounted",
      Self::Mounted => "mounted",
      Self::Scanning => "scanning",
      Self::Scanned => "scanned",
      Self::Fetching => "fetching",
      Self::Updating => "updating",
      Self::Preparing => "preparing",
      Self::Exporting => "exporting",
    }
  }

  /// Whether the stream's filesystem is mounted in this phase
  pub fn is_mounted(self) -> bool {
    matches!(
      self,
      Self::Mounted | Self::Scanning | Self::Scanned | Self::Fetching | Self::Updating | Self::Preparing
    )
  }

  /// The in-progress reason for phases that block every other step
  fn busy(self) -> Option<&'static str> {
    match self {
      Self::Scanning => Some("stream scan in progress"),
      Self::Fetching => Some("fetch in progress"),
      Self::Updating => Some("update in progress"),
      Self::Preparing => Some("preparing to capture"),
      Self::Exporting => Some("export in progress"),
      Self::NoDevice | Self::NotMounted | Self::Mounted | Self::Scanned => None,
    }
  }

  fn reject(self, op: StreamOp, reason: &'static str) -> StatusError {
    StatusError {
      op,
      status: self,
      reason,
    }
  }

  /// Reject `op` while another workflow step holds the stream
  pub fn check_busy(self, op: StreamOp) -> Result<(), StatusError> {
    match self.busy() {
      Some(reason) => Err(self.reject(op, reason)),
      None => Ok(()),
    }
  }

  /// Selecting or changing the stream's device
  pub fn check_associate(self) -> Result<(), StatusError> {
    self.check_busy(StreamOp::Associate)
  }

  /// Mounting; `Ok(false)` means the filesystem is already mounted
  pub fn check_mount(self) -> Result<bool, StatusError> {
    match self {
      Self::NoDevice => Err(self.reject(StreamOp::Mount, "no device")),
      Self::NotMounted => Ok(true),
      _ => Ok(false),
    }
  }

  /// Scanning; `Ok(false)` means the existing scan is kept
  pub fn check_scan(self, skip_if_scanned: bool) -> Result<bool, StatusError> {
    self.check_busy(StreamOp::Scan)?;
    match self {
      Self::NoDevice => Err(self.reject(StreamOp::Scan, "no device")),
      Self::NotMounted => Err(self.reject(StreamOp::Scan, "not mounted")),
      Self::Scanned if skip_if_scanned => Ok(false),
      _ => Ok(true),
    }
  }

  pub fn check_unpack(self) -> Result<(), StatusError> {
    self.check_busy(StreamOp::Unpack)?;
    match self {
      Self::Scanned => Ok(()),
      _ => Err(self.reject(StreamOp::Unpack, "not yet scanned")),
    }
  }

  pub fn check_capture(self) -> Result<(), StatusError> {
    match self {
      Self::NoDevice => Err(self.reject(StreamOp::PrepareForCapture, "no device")),
      Self::NotMounted => Err(self.reject(StreamOp::PrepareForCapture, "not mounted")),
      Self::Mounted => Ok(()),
      Self::Scanned => Err(self.reject(StreamOp::PrepareForCapture, "stream not idle")),
      Self::Preparing => Err(self.reject(StreamOp::PrepareForCapture, "already preparing to capture")),
      _ => self.check_busy(StreamOp::PrepareForCapture),
    }
  }

  /// Releasing the device for copying; `Ok(false)` means already unmounted
  pub fn check_copy(self) -> Result<bool, StatusError> {
    self.check_busy(StreamOp::PrepareForCopy)?;
    match self {
      Self::NoDevice => Err(self.reject(StreamOp::PrepareForCopy, "no device")),
      Self::NotMounted => Ok(false),
      _ => Ok(true),
    }
  }

  /// Exporting; `Ok(true)` means the filesystem must be unmounted first
  pub fn check_export(self) -> Result<bool, StatusError> {
    self.check_busy(StreamOp::Export)?;
    match self {
      Self::NoDevice => Err(self.reject(StreamOp::Export, "no device")),
      Self::NotMounted => Ok(false),
      _ => Ok(true),
    }
  }
}

impl fmt::Display for StreamStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Workflow steps subject to a status guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOp {
  Associate,
  Mount,
  Scan,
  Unpack,
  PrepareForCapture,
  PrepareForCopy,
  Export,
}

impl fmt::Display for StreamOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Associate => "associate",
      Self::Mount => "mount",
      Self::Scan => "scan",
      Self::Unpack => "unpack",
      Self::PrepareForCapture => "prepare for capture",
      Self::PrepareForCopy => "prepare for copy",
      Self::Export => "export",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct StatusError {
  pub op: StreamOp,
  pub status: StreamStatus,
  pub reason: &'static str,
}
