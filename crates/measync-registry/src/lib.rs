//! # measync-registry
//!
//! Keeps the set of known data sources and refreshes them on a timer.
//!
//! - [`SourceHandle`] - one snapshot file or live endpoint and its latest data
//! - [`SourceRegistry`] - all handles, folder discovery and the layout set
//! - [`Poller`] - the tokio task that ticks a registry and serializes mutations
//! - [`ChangeListener`] - the outward notifications

pub mod error;
pub mod notify;
pub mod poller;
pub mod registry;
pub mod source;

pub use error::{PollerError, RegistryError};
pub use notify::{ChangeListener, ChannelListener, RegistryEvent};
pub use poller::{Poller, PollerHandle};
pub use registry::{SourceRegistry, TickReport};
pub use source::{SourceError, SourceHandle, SourceId, SourceStatus};

pub use measync_core::{DataModel, RegistryConfig};
