use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::CacheError;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Runtime is not running")]
    NotRunning,

    #[error("Runtime failed to start: {0}")]
    Startup(String),

    #[error("Gateway could not bind {addr}: {source}")]
    GatewayBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway is not started")]
    GatewayNotStarted,

    #[error("Task cancelled because the runtime is stopping")]
    Cancelled,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl StreamError {
    /// Whether the error came from a corrupt backend session
    pub fn is_corrupt_session(&self) -> bool {
        matches!(self, StreamError::Backend(e) if e.is_corrupt_session())
    }
}
