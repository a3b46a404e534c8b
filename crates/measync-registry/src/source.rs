//! Source handles.
//!
//! A [`SourceHandle`] owns one data source and its most recently loaded
//! [`DataModel`]. The two backing strategies are a snapshot file, re-read on
//! every refresh, and a live endpoint, polled for the newest message.
//!
//! The current model is swapped in one assignment after the read or poll has
//! completed, so a handle is never observed half updated, and a failed
//! refresh leaves the previous model in place.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use measync_core::{CodecError, DataModel, FormatError};
use measync_live::{LiveError, PollOutcome, Subscriber};
use measync_protocol::Endpoint;
use thiserror::Error;
use tracing::{debug, info};

/// Bound on establishing a live connection inside one refresh.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Identity
// ============================================================================

/// Identity of a data source. One handle exists per distinct id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    /// Snapshot file, by absolute path.
    File(PathBuf),
    /// Live channel endpoint.
    Live(Endpoint),
}

impl SourceId {
    /// File source. Relative paths are resolved against the working
    /// directory, then symlinks and `..` are resolved through the filesystem
    /// so one file always maps to one id. A missing file keeps its name under
    /// its canonical parent directory.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let mut path = path.into();
        if path.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                path = cwd.join(path);
            }
        }
        if let Ok(canonical) = std::fs::canonicalize(&path) {
            return SourceId::File(canonical);
        }
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
                Ok(parent) => SourceId::File(parent.join(name)),
                Err(_) => SourceId::File(path),
            },
            _ => SourceId::File(path),
        }
    }

    pub fn live(endpoint: Endpoint) -> Self {
        SourceId::Live(endpoint)
    }

    /// `tcp://` addresses become live sources, anything else a file.
    pub fn parse(raw: &str) -> Result<Self, measync_protocol::EndpointError> {
        if raw.starts_with("tcp://") {
            Ok(SourceId::Live(Endpoint::parse(raw)?))
        } else {
            Ok(SourceId::file(raw))
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SourceId::File(path) => Some(path),
            SourceId::Live(_) => None,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::File(path) => write!(f, "{}", path.display()),
            SourceId::Live(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

// ============================================================================
// Errors and status
// ============================================================================

/// Why a single refresh failed.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backing file is gone. The handle is kept with its last data.
    #[error("Source file missing: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be parsed, typically because it is being written.
    #[error("Corrupt snapshot {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    /// The live connection failed or could not be established.
    #[error("Transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    /// The blocking read task did not complete.
    #[error("Refresh worker failed: {0}")]
    Worker(String),
}

impl SourceError {
    /// Whether the next tick may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SourceError::Worker(_)
                | SourceError::Corrupt {
                    source: FormatError::Hdf5Container,
                    ..
                }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }

    fn transport(endpoint: &Endpoint, err: impl fmt::Display) -> Self {
        SourceError::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<CodecError> for SourceError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::NotFound(path) => SourceError::NotFound(path),
            CodecError::Corrupt { path, source } => SourceError::Corrupt { path, source },
            other => SourceError::Io(other.to_string()),
        }
    }
}

/// Outcome of the most recent refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Never loaded.
    Pending,
    /// Last refresh succeeded.
    Fresh,
    /// Last refresh failed; the data is from an earlier success (or empty).
    Stale,
}

// ============================================================================
// Backends
// ============================================================================

/// Snapshot file backend.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    async fn load(&self) -> Result<DataModel, SourceError> {
        let path = self.path.clone();
        let model = tokio::task::spawn_blocking(move || measync_core::decode(&path))
            .await
            .map_err(|e| SourceError::Worker(e.to_string()))??;
        Ok(model)
    }
}

/// Live channel backend. Connects lazily and reconnects after failures.
pub struct LiveSource {
    endpoint: Endpoint,
    poll_timeout: Duration,
    subscriber: Option<Subscriber>,
}

impl LiveSource {
    async fn poll(&mut self) -> Result<Option<Arc<DataModel>>, SourceError> {
        let mut subscriber = match self.subscriber.take() {
            Some(subscriber) if subscriber.is_connected() => subscriber,
            _ => {
                let connected = tokio::time::timeout(CONNECT_TIMEOUT, Subscriber::connect(&self.endpoint))
                    .await
                    .map_err(|_| SourceError::transport(&self.endpoint, LiveError::Timeout(CONNECT_TIMEOUT)))?
                    .map_err(|e| SourceError::transport(&self.endpoint, e))?;
                info!("Connected live source {}", self.endpoint);
                connected
            }
        };

        // A failed poll drops the subscriber so the next refresh reconnects.
        let outcome = subscriber
            .poll(self.poll_timeout)
            .await
            .map_err(|e| SourceError::transport(&self.endpoint, e))?;
        self.subscriber = Some(subscriber);

        match outcome {
            PollOutcome::Message(model) => Ok(Some(model)),
            PollOutcome::Timeout => Ok(None),
        }
    }
}

enum Backend {
    File(FileSource),
    Live(LiveSource),
}

// ============================================================================
// Handle
// ============================================================================

/// One data source and the latest model loaded from it.
pub struct SourceHandle {
    id: SourceId,
    backend: Backend,
    data: Arc<DataModel>,
    status: SourceStatus,
    updated_at: Option<Instant>,
    stale_since: Option<Instant>,
    missing_since: Option<Instant>,
    refresh_count: u64,
}

impl SourceHandle {
    /// Create a handle for `id`. Live handles bound each poll by `poll_timeout`.
    pub fn new(id: SourceId, poll_timeout: Duration) -> Self {
        let backend = match &id {
            SourceId::File(path) => Backend::File(FileSource { path: path.clone() }),
            SourceId::Live(endpoint) => Backend::Live(LiveSource {
                endpoint: endpoint.clone(),
                poll_timeout,
                subscriber: None,
            }),
        };

        Self {
            id,
            backend,
            data: Arc::new(DataModel::new()),
            status: SourceStatus::Pending,
            updated_at: None,
            stale_since: None,
            missing_since: None,
            refresh_count: 0,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    /// Reload from the backing file or take the newest live message.
    ///
    /// A live source with nothing new is a successful no-op.
    pub async fn refresh(&mut self) -> Result<(), SourceError> {
        let result = match &mut self.backend {
            Backend::File(file) => file.load().await.map(|model| Some(Arc::new(model))),
            Backend::Live(live) => live.poll().await,
        };

        match result {
            Ok(update) => {
                if let Some(model) = update {
                    self.data = model;
                    self.updated_at = Some(Instant::now());
                    self.refresh_count += 1;
                    self.status = SourceStatus::Fresh;
                } else if self.status == SourceStatus::Stale {
                    self.status = SourceStatus::Fresh;
                }
                self.stale_since = None;
                self.missing_since = None;
                Ok(())
            }
            Err(e) => {
                debug!("Refresh of {} failed: {}", self.id, e);
                self.status = SourceStatus::Stale;
                self.stale_since.get_or_insert_with(Instant::now);
                if e.is_not_found() {
                    self.missing_since.get_or_insert_with(Instant::now);
                } else {
                    self.missing_since = None;
                }
                Err(e)
            }
        }
    }

    /// Read-only view of the current model.
    pub fn current_data(&self) -> Arc<DataModel> {
        self.data.clone()
    }

    /// Top-level keys of the current model, `metadata` excluded.
    pub fn graph_keys(&self) -> BTreeSet<String> {
        self.data.graph_keys()
    }

    pub fn status(&self) -> SourceStatus {
        self.status
    }

    /// When data was last swapped in.
    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    /// Start of the current run of failed refreshes.
    pub fn stale_since(&self) -> Option<Instant> {
        self.stale_since
    }

    /// When the backing file was first found missing, while it still is.
    pub fn missing_since(&self) -> Option<Instant> {
        self.missing_since
    }

    /// Number of successful loads that replaced the model.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("graph_keys", &self.graph_keys())
            .field("refresh_count", &self.refresh_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POLL: Duration = Duration::from_millis(100);

    #[test]
    fn test_source_id_parse() {
        let live = SourceId::parse("tcp://localhost:5555").unwrap();
        assert_eq!(live, SourceId::Live(Endpoint::localhost(5555)));
        assert!(live.path().is_none());

        let file = SourceId::parse("/data/a.h5").unwrap();
        assert_eq!(file.path(), Some(Path::new("/data/a.h5")));
        assert_eq!(file.to_string(), "/data/a.h5");

        assert!(SourceId::parse("tcp://nohost").is_err());
    }

    #[test]
    fn test_relative_file_id_is_absolute() {
        let id = SourceId::file("scan.h5");
        assert!(id.path().unwrap().is_absolute());
    }

    #[test]
    fn test_file_id_resolves_dot_dot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.h5"), b"").unwrap();

        let direct = SourceId::file(dir.path().join("a.h5"));
        assert_eq!(SourceId::file(dir.path().join("sub/../a.h5")), direct);

        // Still one id per name once the file is gone.
        std::fs::remove_file(dir.path().join("a.h5")).unwrap();
        assert_eq!(SourceId::file(dir.path().join("a.h5")), direct);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_id_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.h5");
        let link = dir.path().join("link.h5");
        std::fs::write(&target, b"").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(SourceId::file(&link), SourceId::file(&target));
    }

    #[tokio::test]
    async fn test_hdf5_file_is_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.h5");
        let mut bytes = measync_core::codec::HDF5_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, bytes).unwrap();

        let mut handle = SourceHandle::new(SourceId::file(&path), POLL);
        let err = handle.refresh().await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::Corrupt {
                source: FormatError::Hdf5Container,
                ..
            }
        ));
        assert!(!err.is_transient());
        assert_eq!(handle.status(), SourceStatus::Stale);
    }

    #[tokio::test]
    async fn test_file_refresh_swaps_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.h5");
        let model = DataModel::new().with("temp", vec![1.0, 2.0]).unwrap();
        measync_core::encode(&path, &model).unwrap();

        let mut handle = SourceHandle::new(SourceId::file(&path), POLL);
        assert_eq!(handle.status(), SourceStatus::Pending);
        assert!(handle.current_data().is_empty());

        handle.refresh().await.unwrap();
        assert_eq!(handle.status(), SourceStatus::Fresh);
        assert_eq!(*handle.current_data(), model);
        assert_eq!(handle.graph_keys(), BTreeSet::from(["temp".to_string()]));
        assert_eq!(handle.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.h5");
        let model = DataModel::new().with("temp", vec![1.0]).unwrap();
        measync_core::encode(&path, &model).unwrap();

        let mut handle = SourceHandle::new(SourceId::file(&path), POLL);
        handle.refresh().await.unwrap();

        std::fs::write(&path, b"MSNP\x01").unwrap();
        let err = handle.refresh().await.unwrap_err();
        assert!(matches!(err, SourceError::Corrupt { .. }));
        assert!(err.is_transient());
        assert_eq!(handle.status(), SourceStatus::Stale);
        assert!(handle.stale_since().is_some());
        assert!(handle.missing_since().is_none());
        assert_eq!(*handle.current_data(), model);

        std::fs::remove_file(&path).unwrap();
        let err = handle.refresh().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(handle.missing_since().is_some());
        assert_eq!(*handle.current_data(), model);
    }

    #[tokio::test]
    async fn test_live_refresh_without_publisher_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut handle = SourceHandle::new(SourceId::live(Endpoint::new("127.0.0.1", port)), POLL);
        let err = handle.refresh().await.unwrap_err();
        assert!(matches!(err, SourceError::Transport { .. }));
        assert!(err.is_transient());
        assert_eq!(handle.status(), SourceStatus::Stale);
    }
}
