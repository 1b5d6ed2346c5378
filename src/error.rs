//! Error Types

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to generate unique id: {0}")]
    Generation(String),

    #[error("Cannot persist setup at {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("Setup version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Failed to start local slave {index}: {reason}")]
    Spawn { index: usize, reason: String },

    #[error("Server at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Cannot bind control-plane listener on {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Starter API request to {endpoint} failed: {reason}")]
    Client { endpoint: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => 1,
            Error::Generation(_) => 10,
            Error::Persist { .. } => 11,
            Error::VersionMismatch { .. } => 12,
            Error::Spawn { .. } => 20,
            Error::Unreachable { .. } => 21,
            Error::Bind { .. } => 30,
            Error::Client { .. } => 31,
            Error::InvalidConfig { .. } => 60,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generation(_) => "generation",
            Error::Persist { .. } => "persist",
            Error::VersionMismatch { .. } => "version_mismatch",
            Error::Spawn { .. } => "spawn",
            Error::Unreachable { .. } => "unreachable",
            Error::Bind { .. } => "bind",
            Error::Client { .. } => "client",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "other",
        }
    }

    /// Failures that stay local to one peer, slave or server. Everything else
    /// ends the coordinator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Persist { .. }
                | Error::VersionMismatch { .. }
                | Error::Spawn { .. }
                | Error::Unreachable { .. }
                | Error::Client { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let endpoint = err
            .url()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Error::Client {
            endpoint,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failures_are_fatal() {
        let err = Error::Bind {
            address: "0.0.0.0:8528".to_string(),
            reason: "address in use".to_string(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), "bind");
        assert_eq!(err.exit_code(), 30);
    }

    #[test]
    fn slave_failures_are_contained() {
        let err = Error::Spawn {
            index: 2,
            reason: "boom".to_string(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Failed to start local slave 2: boom");
    }
}
