//! State shared between the facade and the stream actors.
//!
//! The registry is the persisted half. Each stream's runtime status and last
//! scanned tree are owned by its actor, which mirrors them into a
//! [`StreamView`] so status reads never wait on a running workflow.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::{
  domain::{filesystem::FileSystem, stream::StreamStatus},
  registry::Registry,
};

#[derive(Debug, Clone, Default)]
pub struct StreamView {
  pub status: StreamStatus,
  pub file_system: Option<Arc<FileSystem>>,
  pub boot_label: Option<String>,
}

#[derive(Debug)]
pub struct SharedState {
  pub registry: Registry,
  pub views: BTreeMap<String, StreamView>,
}

pub type SharedStateRef = Arc<RwLock<SharedState>>;

impl SharedState {
  pub fn new(registry: Registry) -> SharedStateRef {
    Arc::new(RwLock::new(Self {
      registry,
      views: BTreeMap::new(),
    }))
  }

  /// Status of one stream as reported by `GetStatus`
  pub fn stream_status(&self, name: &str) -> Option<StreamStatusInfo> {
    let record = self.registry.stream(name)?;
    let view = self.views.get(name).cloned().unwrap_or_default();
    Some(StreamStatusInfo {
      assigned_device: record.assigned_device.clone(),
      status: view.status,
      has_file_system: view.file_system.is_some(),
      boot_label: view.boot_label,
    })
  }
}

/// Per-stream status reported to clients
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct StreamStatusInfo {
  pub assigned_device: Option<String>,
  pub status: StreamStatus,
  pub has_file_system: bool,
  pub boot_label: Option<String>,
}
