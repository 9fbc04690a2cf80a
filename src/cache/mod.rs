// Gateway module for cache - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod disk;
mod error;
mod store;
mod types;

// Public re-exports - the ONLY way to access cache functionality
pub use error::CacheError;
pub use store::CacheStore;
pub use types::{CacheEntry, CacheSettings, CacheStats, CacheStatus, DiskInfo, SizeTier};

/// Open the cache store configured in `config`
pub fn init(config: &crate::app::CacheConfig) -> anyhow::Result<CacheStore> {
    let directory = config.resolve_directory()?;
    Ok(CacheStore::open(directory, config.settings())?)
}
