// Gateway module for backend - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod directory;
mod error;
#[cfg(test)]
mod memory;
mod traits;
mod types;

// Public re-exports - the ONLY way to access backend functionality
pub use directory::{DirectoryBackend, DirectoryConnector};
pub(crate) use directory::read_file_range;
pub use error::BackendError;
#[cfg(test)]
pub(crate) use memory::{MemoryBackend, MemoryConnector};
pub use traits::{BackendConnector, ChunkStream, RemoteBackend};
pub use types::{MediaInfo, ObjectRef};
