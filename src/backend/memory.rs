use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{BackendConnector, BackendError, ChunkStream, MediaInfo, ObjectRef, RemoteBackend};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mime_type: Option<String>,
}

/// In-memory backend with known content for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<ObjectRef, StoredObject>>>,
    chunk_delay: Option<Duration>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every chunk, to emulate a slow remote
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn insert(&self, object: ObjectRef, data: impl Into<Bytes>, mime_type: Option<&str>) {
        self.objects.write().insert(
            object,
            StoredObject {
                data: data.into(),
                mime_type: mime_type.map(str::to_string),
            },
        );
    }

    /// Number of `fetch_chunk` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn get(&self, object: ObjectRef) -> Result<StoredObject, BackendError> {
        self.objects
            .read()
            .get(&object)
            .cloned()
            .ok_or(BackendError::NotFound(object))
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn resolve_size(&self, object: ObjectRef) -> Result<u64, BackendError> {
        Ok(self.media_info(object).await?.size)
    }

    async fn media_info(&self, object: ObjectRef) -> Result<MediaInfo, BackendError> {
        let stored = self.get(object)?;
        if stored.data.is_empty() {
            return Err(BackendError::UnknownSize(object));
        }
        Ok(MediaInfo {
            file_id: format!("mem_{}_{}", object.chat_id, object.message_id),
            size: stored.data.len() as u64,
            mime_type: stored.mime_type,
        })
    }

    fn fetch_chunk(
        &self,
        object: ObjectRef,
        offset: u64,
        length: u64,
        chunk_size: usize,
    ) -> ChunkStream {
        let data = match self.get(object) {
            Ok(stored) => stored.data,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let total = data.len() as u64;
        let end = offset.saturating_add(length).min(total);
        let chunk_size = chunk_size.max(1) as u64;
        let delay = self.chunk_delay;

        stream::unfold(offset.min(total), move |pos| {
            let data = data.clone();
            async move {
                if pos >= end {
                    return None;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let next = (pos + chunk_size).min(end);
                Some((Ok(data.slice(pos as usize..next as usize)), next))
            }
        })
        .boxed()
    }
}

/// Connector handing out a shared `MemoryBackend`, with scriptable connect failures
#[derive(Debug, Default)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    failures: Mutex<VecDeque<BackendError>>,
    attempts: AtomicUsize,
    session_path: Option<PathBuf>,
}

impl MemoryConnector {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_session_path(mut self, path: PathBuf) -> Self {
        self.session_path = Some(path);
        self
    }

    /// Make the next `connect` fail with `error`
    pub fn fail_next(self, error: BackendError) -> Self {
        self.failures.lock().push_back(error);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteBackend>, BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(Arc::new(self.backend.clone()))
    }

    fn session_path(&self) -> Option<PathBuf> {
        self.session_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_fetch_chunk_respects_bounds() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(1, 1);
        backend.insert(object, (0u8..100).collect::<Vec<_>>(), None);

        let chunks: Vec<Bytes> = backend
            .fetch_chunk(object, 10, 25, 8)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![8, 8, 8, 1]);
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, (10u8..35).collect::<Vec<_>>());
        assert_eq!(backend.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_empty_objects() {
        let backend = MemoryBackend::new();
        let empty = ObjectRef::new(1, 2);
        backend.insert(empty, Vec::new(), None);

        assert!(matches!(
            backend.resolve_size(ObjectRef::new(9, 9)).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            backend.resolve_size(empty).await,
            Err(BackendError::UnknownSize(_))
        ));
    }
}
