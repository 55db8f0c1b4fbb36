//! Client error types

use link_protocol::Stage;
use thiserror::Error;

/// Local storage failure. Callers on the linking path degrade to defaults
/// instead of surfacing these.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage is switched off, full, or otherwise refusing access
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Remote state endpoint failure
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Invalid endpoint URL
    #[error("invalid state endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport-level failure (connect, timeout, body read)
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("state endpoint returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Endpoint answered with a body we could not interpret
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A flow action that could not run
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("{action} is not available at stage {stage}")]
    NotAllowed { action: &'static str, stage: Stage },

    #[error("authenticator code must not be empty")]
    EmptyAuthenticatorCode,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("state endpoint rejected the request")]
    Rejected,
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;
