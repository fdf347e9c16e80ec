use std::io;

use thiserror::Error;

use crate::patch::PatchError;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication failed for key '{key_id}'")]
    AuthenticationFailure { key_id: String },
    #[error("{field} '{value}' rejected: {reason}")]
    PathTraversal {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("version conflict on {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        aggregate_id: String,
        expected: u32,
        actual: u32,
    },
    #[error("aggregate {0} not found")]
    AggregateNotFound(String),
    #[error("aggregate id mismatch: expected {expected}, got {actual}")]
    AggregateMismatch { expected: String, actual: String },
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("snapshot {version} of {aggregate_id} already exists")]
    SnapshotExists { aggregate_id: String, version: u32 },
    #[error("field '{0}' is reserved for project metadata")]
    ReservedField(String),
    #[error("a data key for {0} already exists")]
    KeyExists(String),
    #[error("{operation} failed after {attempts} attempts: {source}")]
    IoRetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse discriminant for callers that map store failures onto another
/// protocol (status codes, retry decisions) without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthenticationFailure,
    PathTraversal,
    VersionConflict,
    Patch,
    NotFound,
    Invalid,
    Io,
    Cancelled,
    Internal,
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
            Self::PathTraversal { .. } => ErrorKind::PathTraversal,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::Patch(_) => ErrorKind::Patch,
            Self::AggregateNotFound(_) => ErrorKind::NotFound,
            Self::AggregateMismatch { .. }
            | Self::InvalidEvent(_)
            | Self::SnapshotExists { .. }
            | Self::KeyExists(_)
            | Self::ReservedField(_)
            | Self::Config(_) => ErrorKind::Invalid,
            Self::IoRetriesExhausted { .. } | Self::Io(_) => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MalformedEnvelope(_) | Self::Serialization(_) | Self::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn authentication(key_id: &str) -> Self {
        Self::AuthenticationFailure {
            key_id: key_id.to_string(),
        }
    }
}

impl From<toml::de::Error> for VaultError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for VaultError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{PatchError, PatchErrorKind};

    #[test]
    fn security_failures_are_not_reported_as_missing() {
        let auth = VaultError::authentication("project-1");
        assert_eq!(auth.kind(), ErrorKind::AuthenticationFailure);

        let traversal = VaultError::PathTraversal {
            field: "aggregate_id",
            value: "../etc".into(),
            reason: "contains a parent directory reference",
        };
        assert_eq!(traversal.kind(), ErrorKind::PathTraversal);
        assert_ne!(traversal.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn patch_errors_keep_their_path() {
        let err: VaultError = PatchError::new(2, "/items/9", PatchErrorKind::PathNotFound).into();
        assert_eq!(err.kind(), ErrorKind::Patch);
        assert!(err.to_string().contains("/items/9"));
    }
}
