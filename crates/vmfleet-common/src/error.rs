//! Error taxonomy shared by every vmfleet crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::object::{Kind, Uid};

/// A single invalid field inside an otherwise well-formed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path to the offending field, e.g. `spec.cpus`.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// No bytes stored for the given identity. Distinct from `Decode`:
    /// callers retry or create on this, but must not on corrupt data.
    #[error("{0} object with UID \"{1}\" not found")]
    NotFound(Kind, Uid),

    /// A name/UID-prefix lookup matched more than one candidate.
    #[error("ambiguous reference {reference:?}: matches {matches:?}")]
    Ambiguous {
        reference: String,
        matches: Vec<String>,
    },

    /// Bytes were present but could not be decoded into a recognized object.
    #[error("decode error: {0}")]
    Decode(String),

    /// Unrecognized object kind in a manifest or reference.
    #[error("unknown kind {0:?}")]
    UnknownKind(String),

    /// Well-formed but semantically invalid object.
    #[error("invalid object: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Validation(Vec<FieldError>),

    /// Aggregate failure from a storage fan-out; one entry per failing
    /// backend, tagged with the backend's index.
    #[error("{}", .0.iter().map(|(i, e)| format!("error in storage backend {i}: {e}")).collect::<Vec<_>>().join("; "))]
    Backend(Vec<(usize, String)>),

    /// A git network operation exceeded its deadline.
    #[error("git {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },

    /// A git subprocess exited non-zero.
    #[error("git {op} failed: {stderr}")]
    Git { op: String, stderr: String },

    /// A watched path is not tracked by the storage's path mapping.
    #[error("path {0:?} is not tracked by this storage")]
    UntrackedPath(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_, _))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
