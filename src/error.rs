//! Error types for the KubeDB operator

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconciliation engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An object with the deterministic child name exists but belongs to someone else
    #[error("intended {kind} \"{namespace}/{name}\" already exists")]
    NamingConflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("timed out after {timeout:?} waiting until {what}")]
    WaitTimeout { what: String, timeout: Duration },

    #[error("wait until {0} was cancelled")]
    Cancelled(String),

    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("invalid object key {0:?}, expected <namespace>/<name>")]
    InvalidKey(String),
}

impl Error {
    /// Whether another attempt can be expected to succeed without user action
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 409 || e.code == 429 || e.code >= 500
            }
            Error::KubeError(_) => true,
            Error::WaitTimeout { .. } | Error::Cancelled(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::NamingConflict { .. }
            | Error::MissingObjectKey(_)
            | Error::InvalidKey(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Optimistic-concurrency failure: someone else wrote the object first
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409 && e.reason != "AlreadyExists")
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists")
    }

    /// Short category used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) if self.is_conflict() => "conflict",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::NamingConflict { .. } => "naming_conflict",
            Error::WaitTimeout { .. } => "wait_timeout",
            Error::Cancelled(_) => "cancelled",
            Error::MissingObjectKey(_) | Error::InvalidKey(_) => "invalid_object",
        }
    }
}
