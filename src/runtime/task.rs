use serde::{Deserialize, Serialize};

use crate::backend::ObjectRef;
use crate::cache::{CacheSettings, CacheStatus};
use crate::proxy::StreamHandle;

/// Work a caller can hand to the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Resolve the object and register a stream token for it
    PrepareStream { object: ObjectRef },
    /// Forget a previously issued token
    ReleaseStream { token: String },
    UpdateCacheSettings { settings: CacheSettings },
    ClearCache,
    CacheStatus,
    /// Finish this task, then stop the loop
    Shutdown,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::PrepareStream { .. } => "prepare_stream",
            Operation::ReleaseStream { .. } => "release_stream",
            Operation::UpdateCacheSettings { .. } => "update_cache_settings",
            Operation::ClearCache => "clear_cache",
            Operation::CacheStatus => "cache_status",
            Operation::Shutdown => "shutdown",
        }
    }
}

/// Successful result of an `Operation`, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationOutput {
    Stream(StreamHandle),
    StreamReleased(bool),
    SettingsApplied { bytes_freed: u64 },
    CacheCleared { bytes_freed: u64 },
    CacheStatus(CacheStatus),
    ShuttingDown,
}

/// What a callback receives: the output, or the stringified failure
pub type TaskResult = Result<OperationOutput, String>;

/// Invoked exactly once per submitted task
pub type Callback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

#[derive(Debug)]
pub(crate) struct Task {
    pub id: u64,
    pub operation: Operation,
}

/// Messages on the loop's queue
#[derive(Debug)]
pub(crate) enum Envelope {
    Task(Task),
    Stop,
}

/// Snapshot of the runtime for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub base_url: Option<String>,
    pub pending_callbacks: usize,
}
