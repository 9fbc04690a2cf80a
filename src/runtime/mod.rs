// Gateway module for runtime - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod task;
mod worker;

// Public re-exports - the ONLY way to access runtime functionality
pub use task::{Callback, Operation, OperationOutput, RuntimeStatus, TaskResult};
pub use worker::WorkerRuntime;
