//! Live channel subscriber.
//!
//! A background task reads frames off the socket and stores the decoded
//! model in a single slot. Polling takes whatever is in the slot; anything
//! that arrived in between was overwritten.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use measync_core::DataModel;
use measync_protocol::{decode_frame, Endpoint, ProtocolError};

use crate::error::LiveError;

/// Result of a single [`Subscriber::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A snapshot newer than the last one taken.
    Message(Arc<DataModel>),
    /// Nothing new arrived within the timeout.
    Timeout,
}

/// Subscribing side of a Live Channel.
pub struct Subscriber {
    endpoint: Endpoint,
    latest: watch::Receiver<Option<Arc<DataModel>>>,
    reader: JoinHandle<()>,
}

impl Subscriber {
    /// Connect to a publisher and start receiving snapshots.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, LiveError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint.ws_url()).await?;
        info!("Subscribed to {}", endpoint);

        let (tx, latest) = watch::channel(None);
        let reader = tokio::spawn(read_frames(ws_stream, tx, endpoint.clone()));

        Ok(Self {
            endpoint: endpoint.clone(),
            latest,
            reader,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait up to `timeout` for a snapshot newer than the last one taken.
    ///
    /// A snapshot that arrived before the connection closed is still
    /// returned; after that the poll fails with [`LiveError::Disconnected`].
    pub async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, LiveError> {
        match tokio::time::timeout(timeout, self.latest.changed()).await {
            Err(_) => Ok(PollOutcome::Timeout),
            Ok(Err(_)) => Err(LiveError::Disconnected(self.endpoint.to_string())),
            Ok(Ok(())) => Ok(self.take_current()),
        }
    }

    /// Non-blocking variant of [`poll`](Self::poll).
    pub fn try_take(&mut self) -> Result<Option<Arc<DataModel>>, LiveError> {
        match self.latest.changed().now_or_never() {
            None => Ok(None),
            Some(Err(_)) => Err(LiveError::Disconnected(self.endpoint.to_string())),
            Some(Ok(())) => match self.take_current() {
                PollOutcome::Message(model) => Ok(Some(model)),
                PollOutcome::Timeout => Ok(None),
            },
        }
    }

    /// Whether the reader task is still attached to the publisher.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    fn take_current(&mut self) -> PollOutcome {
        match self.latest.borrow_and_update().clone() {
            Some(model) => PollOutcome::Message(model),
            None => PollOutcome::Timeout,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    latest: watch::Sender<Option<Arc<DataModel>>>,
    endpoint: Endpoint,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => match decode_frame(&bytes) {
                Ok(model) => {
                    latest.send_replace(Some(Arc::new(model)));
                }
                Err(e) => warn!("Skipping undecodable frame from {}: {}", endpoint, e),
            },
            Ok(Message::Text(_)) => {
                warn!("Skipping frame from {}: {}", endpoint, ProtocolError::TextFrame);
            }
            Ok(Message::Ping(data)) => {
                if ws_tx.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Live channel {} failed: {}", endpoint, e);
                break;
            }
        }
    }

    debug!("Reader for {} finished", endpoint);
}
