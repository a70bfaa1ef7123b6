//! Error types for tsrelabel.

use crate::label::Labels;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tsrelabel operations.
pub type Result<T> = std::result::Result<T, RelabelError>;

/// Coarse classification of a failure, used to decide how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid rule set or block identifier. Never retried.
    Configuration,
    /// Corrupt or missing source block.
    SourceRead,
    /// Destination I/O failure.
    Write,
    /// Two series collapsed onto the same label set.
    Collision,
    /// The metadata file could not be published.
    Publication,
}

/// Main error type for tsrelabel operations.
#[derive(Error, Debug)]
pub enum RelabelError {
    #[error("Invalid block ID '{id}': {reason}")]
    InvalidBlockId { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid relabel regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid block at {path:?}: {reason}")]
    InvalidBlock { path: PathBuf, reason: String },

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("Failed to read series from source block {block}: {source}")]
    SourceRead {
        block: String,
        #[source]
        source: Box<RelabelError>,
    },

    #[error("Failed to write series to block {block}: {source}")]
    Write {
        block: String,
        #[source]
        source: Box<RelabelError>,
    },

    #[error("Series written out of order: {current} does not sort after {previous}")]
    OutOfOrderSeries { previous: Labels, current: Labels },

    #[error("Series {first} and {second} both relabel to {labels}")]
    SeriesCollision {
        labels: Labels,
        first: Labels,
        second: Labels,
    },

    #[error("Failed to publish {path:?}: {source}")]
    Publication {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index encoding error: {0}")]
    IndexEncode(#[from] bincode::error::EncodeError),

    #[error("Index decoding error: {0}")]
    IndexDecode(#[from] bincode::error::DecodeError),
}

impl RelabelError {
    /// Wraps `err` as a failure to read from the source block `block`.
    pub fn source_read(block: impl ToString, err: RelabelError) -> Self {
        RelabelError::SourceRead {
            block: block.to_string(),
            source: Box::new(err),
        }
    }

    /// Wraps `err` as a failure to write to the destination block `block`.
    pub fn write(block: impl ToString, err: RelabelError) -> Self {
        RelabelError::Write {
            block: block.to_string(),
            source: Box::new(err),
        }
    }

    /// Attaches a path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelabelError::IoWithPath {
            path: path.into(),
            source,
        }
    }

    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelabelError::InvalidBlockId { .. }
            | RelabelError::InvalidConfiguration(_)
            | RelabelError::Regex(_)
            | RelabelError::Yaml(_) => ErrorKind::Configuration,
            RelabelError::InvalidBlock { .. }
            | RelabelError::DataCorruption(_)
            | RelabelError::IndexDecode(_)
            | RelabelError::SourceRead { .. } => ErrorKind::SourceRead,
            RelabelError::SeriesCollision { .. } => ErrorKind::Collision,
            RelabelError::Publication { .. } => ErrorKind::Publication,
            RelabelError::Write { .. }
            | RelabelError::OutOfOrderSeries { .. }
            | RelabelError::IoWithPath { .. }
            | RelabelError::Io(_)
            | RelabelError::Json(_)
            | RelabelError::IndexEncode(_) => ErrorKind::Write,
        }
    }
}
