//! Control channel: request/reply commands next to the data channel.
//!
//! Each WebSocket text frame from a client holds one [`ControlRequest`];
//! the server answers every request with exactly one [`ControlReply`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use measync_protocol::{
    decode_reply, decode_request, encode_reply, encode_request, ControlReply, ControlRequest,
    Endpoint, ProtocolError,
};

use crate::error::LiveError;
use crate::publisher::{bind_with_retry, Snapshot};

/// Producer-side handling of control requests.
///
/// Handlers run on the blocking pool, so they may touch the filesystem.
pub trait ControlHandler: Send + Sync + 'static {
    fn handle(&self, request: &ControlRequest) -> ControlReply;
}

/// Writes the latest published snapshot through the snapshot codec, always
/// to the path it was created with.
pub struct SaveSnapshot {
    latest: watch::Receiver<Option<Snapshot>>,
    path: PathBuf,
}

impl SaveSnapshot {
    pub(crate) fn new(latest: watch::Receiver<Option<Snapshot>>, path: PathBuf) -> Self {
        Self { latest, path }
    }

    /// File every save request writes to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn save(&self) -> ControlReply {
        let current = self.latest.borrow().clone();
        let Some(snapshot) = current else {
            return ControlReply::failed("Nothing has been published yet");
        };

        let path = &self.path;
        match measync_core::encode(path, &snapshot.model) {
            Ok(()) => {
                info!("Saved snapshot {} to {}", snapshot.seq, path.display());
                ControlReply::completed(format!("Saved snapshot {}", snapshot.seq))
                    .with_path(path.display().to_string())
            }
            Err(e) => {
                warn!("Save to {} failed: {}", path.display(), e);
                ControlReply::failed(e.to_string())
            }
        }
    }
}

impl ControlHandler for SaveSnapshot {
    fn handle(&self, request: &ControlRequest) -> ControlReply {
        match request {
            ControlRequest::Save => self.save(),
            ControlRequest::Ping => ControlReply::completed("pong"),
        }
    }
}

/// Serves control requests on an endpoint.
pub struct ControlServer {
    endpoint: Endpoint,
    accept_task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `endpoint` with the same port-retry policy as the publisher.
    pub async fn bind(
        endpoint: &Endpoint,
        max_attempts: u32,
        handler: Arc<dyn ControlHandler>,
    ) -> Result<Self, LiveError> {
        let (listener, bound) = bind_with_retry(endpoint, max_attempts).await?;
        info!("Control channel listening on {}", bound);

        let accept_task = tokio::spawn(accept_clients(listener, handler));
        Ok(Self {
            endpoint: bound,
            accept_task,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_clients(listener: TcpListener, handler: Arc<dyn ControlHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, addr, handler).await {
                        warn!("Control client {} error: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept control client: {}", e);
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn ControlHandler>,
) -> Result<(), LiveError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    debug!("Control client connected from {}", addr);

    while let Some(msg) = ws_rx.next().await {
        let reply = match msg? {
            Message::Text(text) => match decode_request(&text) {
                Ok(request) => {
                    debug!("Control request {} from {}", request.name(), addr);
                    let handler = handler.clone();
                    tokio::task::spawn_blocking(move || handler.handle(&request))
                        .await
                        .unwrap_or_else(|e| ControlReply::failed(format!("Handler failed: {e}")))
                }
                Err(e) => ControlReply::failed(e.to_string()),
            },
            Message::Binary(_) => ControlReply::failed(ProtocolError::BinaryFrame.to_string()),
            Message::Ping(data) => {
                ws_tx.send(Message::Pong(data)).await?;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };
        ws_tx.send(Message::Text(encode_reply(&reply)?)).await?;
    }

    debug!("Control client {} disconnected", addr);
    Ok(())
}

/// One-shot control channel client.
pub struct ControlClient;

impl ControlClient {
    /// Send `request` to `endpoint` and wait up to `timeout` for the reply.
    pub async fn request(
        endpoint: &Endpoint,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<ControlReply, LiveError> {
        tokio::time::timeout(timeout, Self::round_trip(endpoint, request))
            .await
            .map_err(|_| LiveError::Timeout(timeout))?
    }

    async fn round_trip(endpoint: &Endpoint, request: &ControlRequest) -> Result<ControlReply, LiveError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(endpoint.ws_url()).await?;
        ws.send(Message::Text(encode_request(request)?)).await?;

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => {
                    let reply = decode_reply(&text)?;
                    let _ = ws.close(None).await;
                    return Ok(reply);
                }
                Message::Binary(_) => return Err(ProtocolError::BinaryFrame.into()),
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(LiveError::Disconnected(endpoint.to_string()))
    }
}
