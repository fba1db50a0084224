//! Device IPC types - two-phase attach and removal
use serde::{Deserialize, Serialize};

use crate::{
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
  unpacker::AddDeviceResult,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum DeviceRequest {
  PrepareForAdd(PrepareForAddDeviceParams),
  Add(AddDeviceParams),
  Remove(RemoveDeviceParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum DeviceResponse {
  PrepareForAdd(PrepareForAddDeviceResult),
  Add(AddDeviceResult),
  Remove(RemoveDeviceResult),
}

// ============================================================================
// Request param types
// ============================================================================

/// Snapshot the visible block devices before the operator plugs one in
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrepareForAddDeviceParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDeviceParams {
  pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveDeviceParams {
  pub device_id: String,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareForAddDeviceResult {
  /// Block devices visible when the snapshot was taken
  pub visible_devices: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDeviceResult {
  pub device_id: String,
}

impl_ipc_request!(
  PrepareForAddDeviceParams => PrepareForAddDeviceResult,
  ResponseData::Device(DeviceResponse::PrepareForAdd(v)) => v,
  v => RequestData::Device(DeviceRequest::PrepareForAdd(v)),
  v => ResponseData::Device(DeviceResponse::PrepareForAdd(v))
);
impl_ipc_request!(
  AddDeviceParams => AddDeviceResult,
  ResponseData::Device(DeviceResponse::Add(v)) => v,
  v => RequestData::Device(DeviceRequest::Add(v)),
  v => ResponseData::Device(DeviceResponse::Add(v))
);
impl_ipc_request!(
  RemoveDeviceParams => RemoveDeviceResult,
  ResponseData::Device(DeviceResponse::Remove(v)) => v,
  v => RequestData::Device(DeviceRequest::Remove(v)),
  v => ResponseData::Device(DeviceResponse::Remove(v))
);
