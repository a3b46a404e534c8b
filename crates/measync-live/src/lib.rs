//! # measync-live
//!
//! Live Channel transport on tokio.
//!
//! - [`Publisher`] binds a data endpoint and pushes whole snapshots
//! - [`Subscriber`] connects to it and keeps only the newest one
//! - [`ControlServer`] / [`ControlClient`] carry out-of-band commands
//!   such as "save the current snapshot now"

pub mod control;
pub mod error;
pub mod publisher;
pub mod subscriber;

pub use control::{ControlClient, ControlHandler, ControlServer, SaveSnapshot};
pub use error::LiveError;
pub use publisher::{Publisher, Snapshot, DEFAULT_BIND_ATTEMPTS};
pub use subscriber::{PollOutcome, Subscriber};
