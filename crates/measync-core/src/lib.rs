//! # measync-core
//!
//! Core measurement data model and snapshot storage.
//!
//! This crate provides:
//! - Data model types (DataModel, Value, Array, Scalar)
//! - The snapshot codec (versioned header plus CBOR body, file and in-memory)
//! - Sidecar file locking for snapshot writers
//! - Registry configuration and its storage
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so it can be driven from blocking worker threads as well as tokio tasks.

pub mod codec;
pub mod config;
pub mod lock;
pub mod model;

pub use codec::{
    decode, decode_from_slice, encode, encode_to_vec, encode_with_policy, is_snapshot_path, CodecError,
    FormatError, SNAPSHOT_EXTENSIONS,
};
pub use config::{ConfigError, ConfigStorage, FileConfigStorage, RegistryConfig};
pub use lock::{LockPolicy, SnapshotLock};
pub use model::*;
