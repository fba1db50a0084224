use std::{
  collections::HashMap,
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use futures::{SinkExt, StreamExt};
use tokio::{
  net::UnixStream,
  sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, warn};

use super::{IpcError, Request, RequestData, Response, ResponseData, ResponseScenario};

type FramedStream = Framed<UnixStream, LinesCodec>;

struct OutboundRequest {
  request: Request,
  response_tx: oneshot::Sender<Response>,
}

/// Trait for typed IPC requests that know their response type.
///
/// Implement this trait for request parameter types to enable type-safe
/// request/response handling via `Client::call()`.
pub trait IpcRequest: Into<RequestData> + Clone {
  /// The expected response type for this request.
  type Response;

  /// Extract the typed response from a ResponseData.
  /// Returns `Err(IpcError::NoResult)` if the response variant doesn't match.
  fn extract(data: ResponseData) -> Result<Self::Response, IpcError>;
}

/// Client for connecting to the daemon.
///
/// Requests may be issued concurrently from clones of one client; replies
/// are matched back to callers by request id.
#[derive(Clone)]
pub struct Client {
  request_tx: mpsc::Sender<OutboundRequest>,
  counter: Arc<AtomicU64>,
}

impl Client {
  pub async fn connect() -> Result<Self, IpcError> {
    Self::connect_to(&crate::dirs::default_socket_path()).await
  }

  pub async fn connect_to(socket_path: &Path) -> Result<Self, IpcError> {
    let stream = UnixStream::connect(socket_path).await?;
    let framed = Framed::new(stream, LinesCodec::new());
    let (sink, read_stream) = framed.split();

    let (request_tx, request_rx) = mpsc::channel(64);
    tokio::spawn(Self::multiplexer(sink, read_stream, request_rx));

    Ok(Self {
      request_tx,
      counter: Arc::new(AtomicU64::new(1)),
    })
  }

  async fn multiplexer(
    mut sink: futures::stream::SplitSink<FramedStream, String>,
    mut stream: futures::stream::SplitStream<FramedStream>,
    mut request_rx: mpsc::Receiver<OutboundRequest>,
  ) {
    let mut pending: HashMap<String, oneshot::Sender<Response>> = HashMap::new();

    loop {
      tokio::select! {
        Some(outbound) = request_rx.recv() => {
          let id = outbound.request.id.clone();
          match serde_json::to_string(&outbound.request) {
            Ok(json) => {
              pending.insert(id.clone(), outbound.response_tx);
              if let Err(e) = sink.send(json).await {
                error!("failed to send request: {e}");
                if let Some(tx) = pending.remove(&id) {
                  let _ = tx.send(Response::error(id, IpcError::Connection(e.to_string())));
                }
              }
            }
            Err(e) => {
              let _ = outbound.response_tx.send(Response::error(id, IpcError::Serde(e.to_string())));
            }
          }
        }

        result = stream.next() => {
          match result {
            Some(Ok(line)) => {
              match serde_json::from_str::<Response>(&line) {
                Ok(response) => {
                  let id = response.id.clone();
                  match pending.remove(&id) {
                    Some(tx) => {
                      if tx.send(response).is_err() {
                        debug!("receiver dropped for request {id}");
                      }
                    }
                    None => warn!("received response for unknown request id: {id}"),
                  }
                }
                Err(e) => {
                  error!("failed to parse response: {e}");
                }
              }
            }
            Some(Err(e)) => {
              error!("connection error: {e}");
              break;
            }
            None => {
              debug!("connection closed");
              break;
            }
          }
        }
      }
    }

    for (id, tx) in pending {
      let _ = tx.send(Response::error(id, IpcError::Connection("connection closed".into())));
    }

    debug!("multiplexer exited");
  }

  /// Send a typed request and receive a typed response.
  ///
  /// The response type is determined by the request type via `IpcRequest`.
  pub async fn call<R: IpcRequest>(&self, req: R) -> Result<R::Response, IpcError> {
    let response = self.request(req).await?;
    match response.scenario {
      ResponseScenario::Result { result } => R::extract(result),
      ResponseScenario::Error { error } => Err(error),
    }
  }

  /// Send a request and receive a single untyped response.
  async fn request(&self, data: impl Into<RequestData>) -> Result<Response, IpcError> {
    let id = self.counter.fetch_add(1, Ordering::Relaxed);
    let request = Request {
      id: id.to_string(),
      data: data.into(),
    };

    let (response_tx, response_rx) = oneshot::channel();
    self
      .request_tx
      .send(OutboundRequest { request, response_tx })
      .await
      .map_err(|_| IpcError::Connection("multiplexer died".into()))?;

    response_rx
      .await
      .map_err(|_| IpcError::Connection("no response received".into()))
  }
}

/// Macro to implement IpcRequest for a request type.
///
/// Full form (4 args) - generates IpcRequest, From<Req> for RequestData, From<Resp> for ResponseData:
/// ```ignore
/// impl_ipc_request!(
///   AddDeviceParams => AddDeviceResult,
///   ResponseData::Device(DeviceResponse::Add(v)) => v,
///   v => RequestData::Device(DeviceRequest::Add(v)),
///   v => ResponseData::Device(DeviceResponse::Add(v))
/// );
/// ```
///
/// Short form (3 args) - skips From<Resp> for ResponseData (use when response type is shared):
/// ```ignore
/// impl_ipc_request!(
///   PrepareForCopyParams => StreamAck,
///   ResponseData::Stream(StreamResponse::Ack(v)) => v,
///   v => RequestData::Stream(StreamRequest::PrepareForCopy(v))
/// );
/// ```
#[macro_export]
macro_rules! impl_ipc_request {
  // Full form: generates all three impls
  ($req:ty => $resp:ty, $resp_pattern:pat => $resp_extract:expr, $req_ident:ident => $req_construct:expr, $resp_ident:ident => $resp_construct:expr) => {
    impl $crate::ipc::client::IpcRequest for $req {
      type Response = $resp;

      fn extract(data: $crate::ipc::ResponseData) -> Result<Self::Response, $crate::ipc::IpcError> {
        match data {
          $resp_pattern => Ok($resp_extract),
          _ => Err($crate::ipc::IpcError::NoResult),
        }
      }
    }

    impl From<$req> for $crate::ipc::RequestData {
      fn from($req_ident: $req) -> Self {
        $req_construct
      }
    }

    impl From<$resp> for $crate::ipc::ResponseData {
      fn from($resp_ident: $resp) -> Self {
        $resp_construct
      }
    }
  };

  // Short form: skips From<Response> for ResponseData (for shared response types)
  ($req:ty => $resp:ty, $resp_pattern:pat => $resp_extract:expr, $req_ident:ident => $req_construct:expr) => {
    impl $crate::ipc::client::IpcRequest for $req {
      type Response = $resp;

      fn extract(data: $crate::ipc::ResponseData) -> Result<Self::Response, $crate::ipc::IpcError> {
        match data {
          $resp_pattern => Ok($resp_extract),
          _ => Err($crate::ipc::IpcError::NoResult),
        }
      }
    }

    impl From<$req> for $crate::ipc::RequestData {
      fn from($req_ident: $req) -> Self {
        $req_construct
      }
    }
  };
}

pub use impl_ipc_request;
