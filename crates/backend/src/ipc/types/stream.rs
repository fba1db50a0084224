//! Stream IPC types - association and the per-stream workflows
use serde::{Deserialize, Serialize};

use crate::{
  actor::message::UnpackReport,
  domain::filesystem::FileSystem,
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
  state::StreamStatusInfo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum StreamRequest {
  Associate(AssociateParams),
  PrepareForUnpack(PrepareForUnpackParams),
  Unpack(UnpackImageParams),
  PrepareForCapture(PrepareForCaptureParams),
  PrepareForCopy(PrepareForCopyParams),
  Export(ExportImageParams),
  FileSystem(GetFileSystemParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum StreamResponse {
  Associate(AssociateResult),
  /// Shared by the workflows that only report the resulting status
  Ack(StreamAck),
  Unpack(UnpackReport),
  FileSystem(FileSystemResult),
}

// ============================================================================
// Request param types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociateParams {
  pub stream: String,
  /// Empty picks any unused device
  #[serde(default)]
  pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForUnpackParams {
  pub stream: String,
  #[serde(default)]
  pub skip_if_scanned: bool,
  /// Return once queued instead of waiting for the scan
  #[serde(default)]
  pub do_not_wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpackImageParams {
  pub stream: String,
  /// Image name below the stream (`<stream>/<image_leaf>`)
  pub image_leaf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForCaptureParams {
  pub stream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForCopyParams {
  pub stream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportImageParams {
  pub stream: String,
  pub export_type: String,
  pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileSystemParams {
  pub stream: String,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociateResult {
  pub stream: String,
  pub device_id: String,
}

/// Stream status after a workflow step
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAck {
  pub stream: String,
  pub status: Option<StreamStatusInfo>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemResult {
  pub stream: String,
  /// `None` when the stream has no unconsumed scan
  pub file_system: Option<FileSystem>,
}

impl_ipc_request!(
  AssociateParams => AssociateResult,
  ResponseData::Stream(StreamResponse::Associate(v)) => v,
  v => RequestData::Stream(StreamRequest::Associate(v)),
  v => ResponseData::Stream(StreamResponse::Associate(v))
);
impl_ipc_request!(
  PrepareForUnpackParams => StreamAck,
  ResponseData::Stream(StreamResponse::Ack(v)) => v,
  v => RequestData::Stream(StreamRequest::PrepareForUnpack(v)),
  v => ResponseData::Stream(StreamResponse::Ack(v))
);
impl_ipc_request!(
  UnpackImageParams => UnpackReport,
  ResponseData::Stream(StreamResponse::Unpack(v)) => v,
  v => RequestData::Stream(StreamRequest::Unpack(v)),
  v => ResponseData::Stream(StreamResponse::Unpack(v))
);
impl_ipc_request!(
  PrepareForCaptureParams => StreamAck,
  ResponseData::Stream(StreamResponse::Ack(v)) => v,
  v => RequestData::Stream(StreamRequest::PrepareForCapture(v))
);
impl_ipc_request!(
  PrepareForCopyParams => StreamAck,
  ResponseData::Stream(StreamResponse::Ack(v)) => v,
  v => RequestData::Stream(StreamRequest::PrepareForCopy(v))
);
impl_ipc_request!(
  ExportImageParams => StreamAck,
  ResponseData::Stream(StreamResponse::Ack(v)) => v,
  v => RequestData::Stream(StreamRequest::Export(v))
);
impl_ipc_request!(
  GetFileSystemParams => FileSystemResult,
  ResponseData::Stream(StreamResponse::FileSystem(v)) => v,
  v => RequestData::Stream(StreamRequest::FileSystem(v)),
  v => ResponseData::Stream(StreamResponse::FileSystem(v))
);
