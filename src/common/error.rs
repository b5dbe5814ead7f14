//! Error types for the service wrapper

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Wrapper error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Status error: {0}")]
    HttpStatus(u16),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Service error: {0}")]
    Driver(String),

    #[error("service not installed")]
    NotInstalled,

    #[error("unsupported system")]
    Unsupported,

    #[error("unknown control action: {0}")]
    UnknownAction(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    pub fn driver<S: Into<String>>(msg: S) -> Self {
        Error::Driver(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Attach the failing operation and path to an IO error
    pub fn fs(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Filesystem {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Driver outcomes that are reported to the user as plain messages
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::NotInstalled | Error::Unsupported)
    }

    /// HTTP statuses above 404 and transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::HttpStatus(code) => *code > 404,
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            Error::HttpStatus(status.as_u16())
        } else {
            Error::Network(e.to_string())
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
