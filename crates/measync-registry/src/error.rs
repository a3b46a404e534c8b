//! Registry-level errors.
//!
//! Per-source refresh failures are [`SourceError`](crate::SourceError)s and
//! never surface here; these are the hard failures a caller has to handle.

use std::path::PathBuf;

use measync_core::ConfigError;
use measync_protocol::EndpointError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid live source: {0}")]
    Endpoint(#[from] EndpointError),

    /// The watch folder could not be listed.
    #[error("Cannot read source folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by a [`PollerHandle`](crate::PollerHandle).
#[derive(Debug, Error)]
pub enum PollerError {
    /// The poller task is no longer running.
    #[error("Poller has stopped")]
    Stopped,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The poller task panicked or was cancelled.
    #[error("Poller task failed: {0}")]
    Task(String),
}
