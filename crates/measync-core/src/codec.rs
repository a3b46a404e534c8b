//! Snapshot codec.
//!
//! Maps a [`DataModel`] to a versioned binary snapshot and back. The same
//! encoding is used for snapshot files and for live frames.
//!
//! ```text
//! snapshot := "MSNP" version:u16le body
//! body     := CBOR encoding of the serde form of DataModel
//! ```
//!
//! Attributes of a node travel as its `metadata` map and are omitted when
//! empty. Text entries stay tagged as strings, so they never come back as
//! byte arrays.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::lock::{LockError, LockPolicy, SnapshotLock};
use crate::model::DataModel;

/// File magic.
pub const MAGIC: &[u8; 4] = b"MSNP";

/// Current format version.
pub const FORMAT_VERSION: u16 = 2;

/// Signature at the start of every HDF5 container.
pub const HDF5_SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// File extensions recognised as snapshots.
pub const SNAPSHOT_EXTENSIONS: &[&str] = &["h5", "hdf5"];

const HEADER_LEN: usize = MAGIC.len() + 2;

/// Structural problems found while decoding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("Input ended after {0} bytes")]
    UnexpectedEof(usize),

    #[error("Not a snapshot (bad magic)")]
    BadMagic,

    /// The file is an HDF5 container from another producer. It will not
    /// become readable by waiting.
    #[error("HDF5 containers are not supported, re-save through measync")]
    Hdf5Container,

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u16),

    /// The CBOR body is truncated, malformed or describes an invalid model.
    #[error("Invalid snapshot body: {0}")]
    Body(String),
}

/// Errors from reading or writing snapshot files.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The snapshot file does not exist.
    #[error("Snapshot not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but its structure could not be parsed. This is
    /// expected while a writer is mid-write.
    #[error("Corrupt snapshot {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    /// The model could not be serialized.
    #[error("Failed to encode snapshot {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    /// Filesystem failure (including failure to create parent directories).
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The directory lock stayed busy for every retry.
    #[error("Lock {} contended after {attempts} attempts", path.display())]
    LockContention { path: PathBuf, attempts: u32 },
}

impl From<LockError> for CodecError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contention { path, attempts } => CodecError::LockContention { path, attempts },
            LockError::Io { path, source } => CodecError::Io { path, source },
        }
    }
}

/// Check whether `path` has one of the snapshot extensions.
pub fn is_snapshot_path(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

// ============================================================================
// File API
// ============================================================================

/// Write `model` to `path`, creating parent directories and holding the
/// directory lock for the duration of the write.
pub fn encode(path: &Path, model: &DataModel) -> Result<(), CodecError> {
    encode_with_policy(path, model, &LockPolicy::default())
}

/// [`encode`] with an explicit lock retry policy.
pub fn encode_with_policy(
    path: &Path,
    model: &DataModel,
    policy: &LockPolicy,
) -> Result<(), CodecError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|source| CodecError::Io {
        path: dir.clone(),
        source,
    })?;

    let bytes = encode_to_vec(model).map_err(|source| CodecError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let _lock = SnapshotLock::acquire(&dir, policy)?;
    let io_err = |source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_data().map_err(io_err)?;
    Ok(())
}

/// Read the snapshot at `path`. No lock is taken.
pub fn decode(path: &Path) -> Result<DataModel, CodecError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            CodecError::NotFound(path.to_path_buf())
        } else {
            CodecError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    decode_from_slice(&bytes).map_err(|source| CodecError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// In-memory API
// ============================================================================

/// Encode a model into a byte buffer.
pub fn encode_to_vec(model: &DataModel) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    serde_cbor::to_writer(&mut out, model).map_err(|err| FormatError::Body(err.to_string()))?;
    Ok(out)
}

/// Decode a model from a byte buffer, rejecting trailing data.
pub fn decode_from_slice(bytes: &[u8]) -> Result<DataModel, FormatError> {
    if bytes.starts_with(HDF5_SIGNATURE) {
        return Err(FormatError::Hdf5Container);
    }
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::UnexpectedEof(bytes.len()));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    serde_cbor::from_slice(body).map_err(|err| FormatError::Body(err.to_string()))
}
