//! IPC server for the unpacker daemon.
//!
//! The server accepts connections on a Unix socket and hands each request
//! to the [`Unpacker`] facade. Requests on one connection run concurrently;
//! each reply carries its request id so the client can match it up.
//!
//! # Example
//!
//! ```ignore
//! let config = ServerConfig {
//!     socket_path: PathBuf::from("/run/user/0/image-unpacker.sock"),
//!     unpacker: Arc::new(unpacker),
//!     daemon_state: Arc::new(DaemonState::new(false)),
//!     shutdown: cancel.clone(),
//! };
//!
//! let server = Server::new(config);
//! server.run(cancel.child_token()).await?;
//! ```

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Instant,
};

use futures::{SinkExt, StreamExt};
use tokio::{
  net::{UnixListener, UnixStream},
  sync::mpsc,
};
use tokio_util::{
  codec::{Framed, LinesCodec},
  sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  error::UnpackerError,
  ipc::{
    IpcError, Request, RequestData, Response, ResponseData,
    device::{DeviceRequest, DeviceResponse, PrepareForAddDeviceResult, RemoveDeviceResult},
    stream::{AssociateResult, FileSystemResult, StreamAck, StreamRequest, StreamResponse},
    system::{ShutdownResult, StatusResult, SystemRequest, SystemResponse},
  },
  unpacker::Unpacker,
};

// ============================================================================
// Server Configuration
// ============================================================================

/// Daemon facts reported by the status request
#[derive(Debug)]
pub struct DaemonState {
  pub started_at: Instant,
  pub foreground: bool,
}

impl DaemonState {
  pub fn new(foreground: bool) -> Self {
    Self {
      started_at: Instant::now(),
      foreground,
    }
  }
}

/// Configuration for the IPC server.
///
/// All dependencies are provided upfront and immutable after construction.
pub struct ServerConfig {
  /// Path to the Unix socket for IPC
  pub socket_path: PathBuf,

  /// Facade every request is dispatched to
  pub unpacker: Arc<Unpacker>,

  pub daemon_state: Arc<DaemonState>,

  /// Cancelled by a client shutdown request
  pub shutdown: CancellationToken,
}

/// Shared by every connection task
struct Context {
  unpacker: Arc<Unpacker>,
  daemon_state: Arc<DaemonState>,
  shutdown: CancellationToken,
  request_count: AtomicU64,
}

// ============================================================================
// Server
// ============================================================================

/// IPC server that accepts connections and dispatches requests.
///
/// # Lifecycle
///
/// 1. `Server::new()` creates the server with all dependencies
/// 2. `Server::run()` binds the socket and accepts connections
/// 3. Each connection spawns a `handle_connection` task
/// 4. On cancellation, remove the socket and exit
pub struct Server {
  socket_path: PathBuf,
  context: Arc<Context>,
}

impl Server {
  pub fn new(config: ServerConfig) -> Self {
    Self {
      socket_path: config.socket_path,
      context: Arc::new(Context {
        unpacker: config.unpacker,
        daemon_state: config.daemon_state,
        shutdown: config.shutdown,
        request_count: AtomicU64::new(0),
      }),
    }
  }

  /// Run the server until the cancellation token is triggered.
  pub async fn run(&self, cancel: CancellationToken) -> Result<(), IpcError> {
    // Remove stale socket file
    if self.socket_path.exists() {
      tokio::fs::remove_file(&self.socket_path).await?;
    }

    if let Some(parent) = self.socket_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&self.socket_path)?;
    info!("Server listening on {:?}", self.socket_path);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Server shutting down (cancelled)");
          break;
        }

        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let context = Arc::clone(&self.context);
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, context).await {
                  debug!(error = %e, "Connection ended with error");
                }
              });
            }
            Err(e) => {
              error!("Accept error: {}", e);
            }
          }
        }
      }
    }

    if self.socket_path.exists() {
      tokio::fs::remove_file(&self.socket_path).await?;
    }

    info!(
      requests = self.context.request_count.load(Ordering::Relaxed),
      "Server stopped"
    );
    Ok(())
  }
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Handle a single client connection.
///
/// # Protocol
///
/// - Requests: JSON objects, one per line
/// - Responses: JSON objects, one per line, in completion order
///
/// Parse errors and operation errors are answered without closing the
/// connection; IO errors close it. Replies still in flight when the client
/// disconnects are dropped.
async fn handle_connection(stream: UnixStream, context: Arc<Context>) -> Result<(), IpcError> {
  debug!("Client connected");
  let framed = Framed::new(stream, LinesCodec::new());
  let (mut sink, mut stream) = framed.split();
  let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();
  let mut requests = 0u64;

  loop {
    tokio::select! {
      Some(response) = response_rx.recv() => {
        sink.send(serde_json::to_string(&response)?).await?;
      }

      line = stream.next() => {
        let line = match line {
          Some(Ok(line)) => line,
          Some(Err(e)) => {
            warn!(error = %e, "Error reading from client");
            break;
          }
          None => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
          Ok(r) => r,
          Err(e) => {
            warn!("Invalid request JSON: {}", e);
            let response = Response::rpc_error("unknown", -32700, format!("Parse error: {}", e));
            sink.send(serde_json::to_string(&response)?).await?;
            continue;
          }
        };

        requests += 1;
        context.request_count.fetch_add(1, Ordering::Relaxed);
        let context = Arc::clone(&context);
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
          let response = handle_request(&context, request).await;
          let _ = response_tx.send(response);
        });
      }
    }
  }

  debug!(requests_handled = requests, "Client disconnected");
  Ok(())
}

async fn handle_request(context: &Context, request: Request) -> Response {
  let start = Instant::now();
  trace!(method = ?request.data, id = %request.id, "Processing request");

  let response = match dispatch(context, request.data).await {
    Ok(data) => Response::success(&request.id, data),
    Err(e) => {
      debug!(id = %request.id, code = e.code(), error = %e, "Request failed");
      Response::error(&request.id, e.into())
    }
  };

  debug!(
    id = %request.id,
    elapsed_ms = start.elapsed().as_millis() as u64,
    "Request completed"
  );
  response
}

/// Route one request to the facade
async fn dispatch(context: &Context, data: RequestData) -> Result<ResponseData, UnpackerError> {
  let unpacker = &context.unpacker;
  let data = match data {
    RequestData::System(request) => ResponseData::System(match request {
      SystemRequest::Ping(_) => SystemResponse::Ping("pong".to_string()),
      SystemRequest::Status(_) => SystemResponse::Status(StatusResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: context.daemon_state.started_at.elapsed().as_secs(),
        foreground: context.daemon_state.foreground,
        unpacker: unpacker.get_status().await,
      }),
      SystemRequest::Shutdown(_) => {
        info!("Shutdown requested by client");
        context.shutdown.cancel();
        SystemResponse::Shutdown(ShutdownResult {
          message: "Shutting down".to_string(),
        })
      }
    }),

    RequestData::Device(request) => ResponseData::Device(match request {
      DeviceRequest::PrepareForAdd(_) => DeviceResponse::PrepareForAdd(PrepareForAddDeviceResult {
        visible_devices: unpacker.prepare_for_add_device().await?,
      }),
      DeviceRequest::Add(params) => DeviceResponse::Add(unpacker.add_device(&params.device_id).await?),
      DeviceRequest::Remove(params) => {
        unpacker.remove_device(&params.device_id).await?;
        DeviceResponse::Remove(RemoveDeviceResult {
          device_id: params.device_id,
        })
      }
    }),

    RequestData::Stream(request) => ResponseData::Stream(match request {
      StreamRequest::Associate(params) => StreamResponse::Associate(AssociateResult {
        device_id: unpacker
          .associate_stream_with_device(&params.stream, &params.device_id)
          .await?,
        stream: params.stream,
      }),
      StreamRequest::PrepareForUnpack(params) => {
        unpacker
          .prepare_for_unpack(&params.stream, params.skip_if_scanned, params.do_not_wait)
          .await?;
        StreamResponse::Ack(ack(unpacker, params.stream).await)
      }
      StreamRequest::Unpack(params) => {
        StreamResponse::Unpack(unpacker.unpack_image(&params.stream, &params.image_leaf).await?)
      }
      StreamRequest::PrepareForCapture(params) => {
        unpacker.prepare_for_capture(&params.stream).await?;
        StreamResponse::Ack(ack(unpacker, params.stream).await)
      }
      StreamRequest::PrepareForCopy(params) => {
        unpacker.prepare_for_copy(&params.stream).await?;
        StreamResponse::Ack(ack(unpacker, params.stream).await)
      }
      StreamRequest::Export(params) => {
        unpacker
          .export_image(&params.stream, &params.export_type, &params.destination)
          .await?;
        StreamResponse::Ack(ack(unpacker, params.stream).await)
      }
      StreamRequest::FileSystem(params) => {
        let file_system = unpacker.get_file_system(&params.stream).await?;
        StreamResponse::FileSystem(FileSystemResult {
          stream: params.stream,
          file_system: file_system.map(|fs| (*fs).clone()),
        })
      }
    }),
  };
  Ok(data)
}

async fn ack(unpacker: &Unpacker, stream: String) -> StreamAck {
  let status = unpacker.get_status().await.streams.remove(&stream);
  StreamAck { stream, status }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    actor::__tests__::helpers::UnpackerTestContext,
    domain::stream::StreamStatus,
    ipc::{
      Client,
      device::{AddDeviceParams, PrepareForAddDeviceParams, RemoveDeviceParams},
      stream::{GetFileSystemParams, PrepareForUnpackParams},
      system::{PingParams, ShutdownParams, StatusParams},
    },
  };

  async fn start(ctx: &UnpackerTestContext) -> (PathBuf, CancellationToken) {
    let socket_path = ctx.state_dir.path().join("test.sock");
    let cancel = CancellationToken::new();
    let server = Server::new(ServerConfig {
      socket_path: socket_path.clone(),
      unpacker: Arc::new(ctx.load().await),
      daemon_state: Arc::new(DaemonState::new(true)),
      shutdown: cancel.clone(),
    });
    let server_cancel = cancel.child_token();
    tokio::spawn(async move { server.run(server_cancel).await });

    for _ in 0..50 {
      if socket_path.exists() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (socket_path, cancel)
  }

  #[tokio::test]
  async fn test_ping_and_status() {
    let ctx = UnpackerTestContext::new();
    let (socket_path, cancel) = start(&ctx).await;
    let client = Client::connect_to(&socket_path).await.expect("connect");

    assert_eq!(client.call(PingParams).await.unwrap(), "pong");
    let status = client.call(StatusParams).await.unwrap();
    assert!(status.foreground);
    assert!(status.unpacker.devices.is_empty());

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_workflow_over_ipc() {
    let ctx = UnpackerTestContext::new();
    let (socket_path, cancel) = start(&ctx).await;
    let client = Client::connect_to(&socket_path).await.expect("connect");

    let prepared = client.call(PrepareForAddDeviceParams).await.unwrap();
    assert_eq!(prepared.visible_devices, 0);
    ctx.devices.plug("sdb");
    let added = client
      .call(AddDeviceParams {
        device_id: "dev0".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(added.device_name, "sdb");

    let ack = client
      .call(PrepareForUnpackParams {
        stream: "db1".to_string(),
        skip_if_scanned: false,
        do_not_wait: false,
      })
      .await
      .unwrap();
    assert_eq!(ack.status.map(|s| s.status), Some(StreamStatus::Scanned));

    let fs = client
      .call(GetFileSystemParams {
        stream: "db1".to_string(),
      })
      .await
      .unwrap();
    assert!(fs.file_system.is_some());

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_errors_carry_codes() {
    let ctx = UnpackerTestContext::new();
    let (socket_path, cancel) = start(&ctx).await;
    let client = Client::connect_to(&socket_path).await.expect("connect");

    let err = client
      .call(RemoveDeviceParams {
        device_id: "dev9".to_string(),
      })
      .await
      .unwrap_err();
    assert_eq!(
      err,
      IpcError::Rpc {
        code: -32001,
        message: "unknown device ID: dev9".to_string()
      }
    );

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_shutdown_request_cancels_daemon() {
    let ctx = UnpackerTestContext::new();
    let (socket_path, cancel) = start(&ctx).await;
    let client = Client::connect_to(&socket_path).await.expect("connect");

    let result = client.call(ShutdownParams).await.unwrap();
    assert_eq!(result.message, "Shutting down");
    assert!(cancel.is_cancelled());
  }
}
