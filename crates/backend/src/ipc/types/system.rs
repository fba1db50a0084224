//! System IPC types - daemon liveness, status and shutdown
use serde::{Deserialize, Serialize};

use crate::{
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
  unpacker::UnpackerStatus,
};

// ============================================================================
// Request/Response enums
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum SystemRequest {
  Ping(PingParams),
  Status(StatusParams),
  Shutdown(ShutdownParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum SystemResponse {
  Ping(String),
  Status(StatusResult),
  Shutdown(ShutdownResult),
}

// ============================================================================
// Request param types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PingParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShutdownParams;

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
  pub version: String,
  pub uptime_seconds: u64,
  pub foreground: bool,
  pub unpacker: UnpackerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResult {
  pub message: String,
}

impl_ipc_request!(
  PingParams => String,
  ResponseData::System(SystemResponse::Ping(v)) => v,
  v => RequestData::System(SystemRequest::Ping(v))
);
impl_ipc_request!(
  StatusParams => StatusResult,
  ResponseData::System(SystemResponse::Status(v)) => v,
  v => RequestData::System(SystemRequest::Status(v)),
  v => ResponseData::System(SystemResponse::Status(v))
);
impl_ipc_request!(
  ShutdownParams => ShutdownResult,
  ResponseData::System(SystemResponse::Shutdown(v)) => v,
  v => RequestData::System(SystemRequest::Shutdown(v)),
  v => ResponseData::System(SystemResponse::Shutdown(v))
);
