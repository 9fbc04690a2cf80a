use thiserror::Error;

use super::ObjectRef;
use crate::constants::CORRUPT_SESSION_SIGNATURES;

/// Errors raised by a remote backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Object {0} not found")]
    NotFound(ObjectRef),

    #[error("Could not determine file size for {0}")]
    UnknownSize(ObjectRef),

    #[error("Local session state is corrupt: {0}")]
    CorruptSession(String),

    #[error("Remote transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether this failure means the local session state must be discarded
    pub fn is_corrupt_session(&self) -> bool {
        match self {
            BackendError::CorruptSession(_) => true,
            other => {
                let message = other.to_string();
                CORRUPT_SESSION_SIGNATURES
                    .iter()
                    .any(|signature| message.contains(signature))
            }
        }
    }
}
