//! # measync-protocol
//!
//! Wire-level definitions shared by live producers and consumers.
//!
//! This crate defines:
//! - `tcp://host:port` endpoint addressing
//! - Control channel request/reply messages
//! - Encoding of live frames and control messages

pub mod codec;
pub mod endpoint;
pub mod messages;

pub use codec::*;
pub use endpoint::{Endpoint, EndpointError, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};
pub use messages::*;
