use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;

use super::{BackendError, MediaInfo, ObjectRef};

/// Lazy, finite sequence of chunks. Dropping it early cancels the read.
pub type ChunkStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Remote store that holds the media objects
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Resolve the total size of an object; fails if unknown
    async fn resolve_size(&self, object: ObjectRef) -> Result<u64, BackendError>;

    /// Resolve size, file id and media type in one round trip
    async fn media_info(&self, object: ObjectRef) -> Result<MediaInfo, BackendError> {
        let size = self.resolve_size(object).await?;
        Ok(MediaInfo {
            file_id: format!("{}_{}", object.chat_id, object.message_id),
            size,
            mime_type: None,
        })
    }

    /// Read `length` bytes starting at `offset` in chunks of at most `chunk_size`
    fn fetch_chunk(
        &self,
        object: ObjectRef,
        offset: u64,
        length: u64,
        chunk_size: usize,
    ) -> ChunkStream;

    /// Release the connection. Called once from the owning loop on shutdown.
    async fn disconnect(&self) {}
}

/// Establishes the backend connection on the worker thread
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteBackend>, BackendError>;

    /// Local session state that may be purged when it turns out to be corrupt
    fn session_path(&self) -> Option<PathBuf> {
        None
    }
}
