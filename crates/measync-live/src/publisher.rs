//! Live channel publisher.
//!
//! The publisher keeps exactly one pending snapshot. Each connected
//! subscriber has its own task that forwards whatever is newest when the
//! socket is ready again, so a slow subscriber skips snapshots instead of
//! queueing them and `publish` never waits on the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use measync_core::DataModel;
use measync_protocol::{encode_frame, Endpoint};

use crate::control::SaveSnapshot;
use crate::error::LiveError;

/// Ports tried by [`Publisher::bind`] before giving up.
pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;

/// One published snapshot together with its encoded frame.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Publish sequence number, starting at 1.
    pub seq: u64,
    pub model: Arc<DataModel>,
    pub frame: Arc<Vec<u8>>,
}

/// Publishing side of a Live Channel.
pub struct Publisher {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    latest: watch::Sender<Option<Snapshot>>,
    seq: AtomicU64,
    connected: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Bind `endpoint`, moving to the next port while the current one is in
    /// use, at most `max_attempts` times.
    pub async fn bind(endpoint: &Endpoint, max_attempts: u32) -> Result<Self, LiveError> {
        let (listener, bound) = bind_with_retry(endpoint, max_attempts).await?;
        let local_addr = listener.local_addr()?;
        info!("Live channel publishing on {}", bound);

        let (latest, rx) = watch::channel(None);
        let connected = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_subscribers(listener, rx, connected.clone()));

        Ok(Self {
            endpoint: bound,
            local_addr,
            latest,
            seq: AtomicU64::new(0),
            connected,
            accept_task,
        })
    }

    /// Endpoint actually bound, after any port retries.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replace the pending snapshot with `model` and return its sequence
    /// number. Never blocks.
    pub fn publish(&self, model: &DataModel) -> Result<u64, LiveError> {
        let frame = encode_frame(model)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Snapshot {
            seq,
            model: Arc::new(model.clone()),
            frame: Arc::new(frame),
        };
        self.latest.send_replace(Some(snapshot));
        Ok(seq)
    }

    /// Most recently published data model.
    pub fn latest(&self) -> Option<Arc<DataModel>> {
        self.latest.borrow().as_ref().map(|s| s.model.clone())
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Control handler that saves this publisher's latest snapshot to `path`.
    pub fn save_handler(&self, path: impl Into<std::path::PathBuf>) -> SaveSnapshot {
        SaveSnapshot::new(self.latest.subscribe(), path.into())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // Connection tasks end on their own once the sender is gone.
        self.accept_task.abort();
    }
}

/// Bind a listener for `endpoint`, trying successive ports on `AddrInUse`.
///
/// Returns the listener and the endpoint it ended up on.
pub(crate) async fn bind_with_retry(
    endpoint: &Endpoint,
    max_attempts: u32,
) -> Result<(TcpListener, Endpoint), LiveError> {
    let attempts = max_attempts.max(1);
    let mut current = endpoint.clone();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match TcpListener::bind(current.bind_addr()).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, current.with_port(port)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                let next = current.port().checked_add(1);
                match next {
                    Some(port) if attempt < attempts => {
                        warn!("{} is in use, trying port {}", current, port);
                        current = current.with_port(port);
                    }
                    _ => {
                        return Err(LiveError::AddrInUse {
                            endpoint: endpoint.to_string(),
                            attempts: attempt,
                        });
                    }
                }
            }
            Err(e) => {
                return Err(LiveError::Bind {
                    endpoint: current.to_string(),
                    source: e,
                });
            }
        }
    }
}

/// Decrements the subscriber count when a connection task ends.
struct ConnectedGuard(Arc<AtomicUsize>);

impl Drop for ConnectedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_subscribers(
    listener: TcpListener,
    latest: watch::Receiver<Option<Snapshot>>,
    connected: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let latest = latest.clone();
                let connected = connected.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_subscriber(stream, addr, latest, connected).await {
                        warn!("Subscriber {} dropped: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept subscriber: {}", e);
            }
        }
    }
}

/// Forward snapshots to one subscriber until either side goes away.
async fn serve_subscriber(
    stream: TcpStream,
    addr: SocketAddr,
    mut latest: watch::Receiver<Option<Snapshot>>,
    connected: Arc<AtomicUsize>,
) -> Result<(), LiveError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    connected.fetch_add(1, Ordering::Relaxed);
    let _guard = ConnectedGuard(connected);
    info!("Subscriber connected from {}", addr);

    let mut last_sent: Option<u64> = None;

    // Late joiners start from the current snapshot.
    let current = latest.borrow_and_update().clone();
    if let Some(snapshot) = current {
        ws_tx.send(Message::Binary(snapshot.frame.to_vec())).await?;
        last_sent = Some(snapshot.seq);
    }

    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    debug!("Publisher closed, disconnecting {}", addr);
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                let pending = latest.borrow_and_update().clone();
                let Some(snapshot) = pending else { continue };

                if let Some(prev) = last_sent {
                    let skipped = snapshot.seq.saturating_sub(prev + 1);
                    if skipped > 0 {
                        warn!("Dropped {} snapshot(s) for slow subscriber {}", skipped, addr);
                    }
                }
                ws_tx.send(Message::Binary(snapshot.frame.to_vec())).await?;
                last_sent = Some(snapshot.seq);
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Subscriber {} disconnected", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    _ => {} // Subscribers have nothing to say
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = Publisher::bind(&Endpoint::new("127.0.0.1", 0), 1).await.unwrap();
        assert!(publisher.latest().is_none());
        assert_eq!(publisher.subscriber_count(), 0);

        let model = DataModel::new().with("x", vec![1.0, 2.0]).unwrap();
        assert_eq!(publisher.publish(&model).unwrap(), 1);
        assert_eq!(publisher.publish(&model).unwrap(), 2);
        assert_eq!(publisher.latest().as_deref(), Some(&model));
    }

    #[tokio::test]
    async fn test_bound_endpoint_reports_real_port() {
        let publisher = Publisher::bind(&Endpoint::new("127.0.0.1", 0), 1).await.unwrap();
        assert_ne!(publisher.endpoint().port(), 0);
        assert_eq!(publisher.endpoint().port(), publisher.local_addr().port());
    }

    #[tokio::test]
    async fn test_bind_gives_up_after_attempts() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_with_retry(&Endpoint::new("127.0.0.1", port), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::AddrInUse { attempts: 1, .. }));
    }
}
