pub mod app;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod constants;
pub mod proxy;
pub mod runtime;
pub mod utils;

pub use app::{load_config, Config};
pub use backend::{BackendConnector, ObjectRef, RemoteBackend};
pub use cache::{CacheSettings, CacheStore};
pub use proxy::{StreamHandle, StreamingGateway};
pub use runtime::{Operation, OperationOutput, WorkerRuntime};
pub use utils::StreamError;
