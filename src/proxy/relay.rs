use axum::body::Body;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ChunkStream, MediaInfo, ObjectRef};
use crate::cache::{CacheEntry, CacheStore};
use crate::constants::RELAY_PROGRESS_LOG_BYTES;

/// Set of file ids currently being written into the cache
pub(crate) type ActiveTees = Arc<Mutex<HashSet<String>>>;

/// Exclusive right to write one file id; released on drop
struct TeeClaim {
    file_id: String,
    active: ActiveTees,
}

impl Drop for TeeClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.file_id);
    }
}

/// Copy of a full-object response being written into the cache
pub(crate) struct Tee {
    claim: Option<TeeClaim>,
    object: ObjectRef,
    size: u64,
    file: Option<File>,
    written: u64,
    partial_path: PathBuf,
    final_path: PathBuf,
    cache: Arc<CacheStore>,
    committed: bool,
}

impl Tee {
    /// Start a tee unless another response is already writing this file id
    pub(crate) async fn create(
        cache: Arc<CacheStore>,
        active: ActiveTees,
        object: ObjectRef,
        media: &MediaInfo,
    ) -> Option<Tee> {
        if !active.lock().insert(media.file_id.clone()) {
            debug!(file_id = %media.file_id, "download already being cached");
            return None;
        }

        let mut tee = Tee {
            claim: Some(TeeClaim {
                file_id: media.file_id.clone(),
                active,
            }),
            object,
            size: media.size,
            file: None,
            written: 0,
            partial_path: cache.partial_path(&media.file_id),
            final_path: cache.blob_path(&media.file_id),
            cache,
            committed: false,
        };

        match File::create(&tee.partial_path).await {
            Ok(file) => {
                tee.file = Some(file);
                Some(tee)
            }
            Err(e) => {
                warn!(path = %tee.partial_path.display(), error = %e, "cannot create partial cache file");
                None
            }
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Move the finished file into place and admit it on the blocking pool
    async fn commit(mut self) {
        if self.written != self.size {
            warn!(written = self.written, size = self.size, "tee incomplete, discarding");
            return;
        }

        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(error = %e, "failed to flush cache file");
                return;
            }
        }
        if let Err(e) = tokio::fs::rename(&self.partial_path, &self.final_path).await {
            warn!(error = %e, "failed to move cache file into place");
            return;
        }
        self.committed = true;

        let Some(claim) = self.claim.take() else {
            return;
        };
        let cache = self.cache.clone();
        let entry = CacheEntry::new(
            claim.file_id.clone(),
            self.object,
            self.final_path.clone(),
            self.size,
        );

        tokio::task::spawn_blocking(move || {
            match cache.add(entry) {
                Ok(freed) => info!(file_id = %claim.file_id, freed, "download cached"),
                Err(e) => warn!(file_id = %claim.file_id, error = %e, "failed to index cached download"),
            }
            drop(claim);
        });
    }
}

impl Drop for Tee {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.partial_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.partial_path.display(), error = %e, "failed to remove partial cache file");
                }
            }
        }
    }
}

/// Pumps chunks from a source into one HTTP response body
pub(crate) struct Relay {
    token: String,
    chunks: ChunkStream,
    expected: u64,
    sent: u64,
    next_log: u64,
    tee: Option<Tee>,
    done: bool,
}

impl Relay {
    pub(crate) fn new(token: String, chunks: ChunkStream, expected: u64, tee: Option<Tee>) -> Self {
        Self {
            token,
            chunks,
            expected,
            sent: 0,
            next_log: RELAY_PROGRESS_LOG_BYTES,
            tee,
            done: expected == 0,
        }
    }

    pub(crate) fn into_body(self) -> Body {
        Body::from_stream(stream::unfold(self, |mut relay| async move {
            let item = relay.next_chunk().await?;
            Some((item, relay))
        }))
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>> {
        if self.done {
            return None;
        }

        match self.chunks.next().await {
            Some(Ok(chunk)) => {
                let remaining = self.expected - self.sent;
                let chunk = if chunk.len() as u64 > remaining {
                    chunk.slice(..remaining as usize)
                } else {
                    chunk
                };
                self.sent += chunk.len() as u64;

                if let Some(tee) = self.tee.as_mut() {
                    if let Err(e) = tee.write(&chunk).await {
                        warn!(token = %self.token, error = %e, "cache write failed, continuing without it");
                        self.tee = None;
                    }
                }

                if self.sent >= self.next_log {
                    debug!(token = %self.token, sent = self.sent, expected = self.expected, "relay progress");
                    self.next_log += RELAY_PROGRESS_LOG_BYTES;
                }

                // Finish before handing out the last bytes: the client may
                // hang up as soon as it has Content-Length bytes.
                if self.sent == self.expected {
                    self.finish().await;
                }
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                warn!(token = %self.token, sent = self.sent, error = %e, "remote read failed mid-stream");
                self.done = true;
                self.tee = None;
                Some(Err(e))
            }
            None => {
                self.done = true;
                self.tee = None;
                warn!(token = %self.token, sent = self.sent, expected = self.expected, "source ended early");
                Some(Err(BackendError::Transport(format!(
                    "stream ended after {} of {} bytes",
                    self.sent, self.expected
                ))))
            }
        }
    }

    async fn finish(&mut self) {
        self.done = true;
        if let Some(tee) = self.tee.take() {
            tee.commit().await;
        }
        debug!(token = %self.token, bytes = self.sent, "relay complete");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if !self.done {
            debug!(
                token = %self.token,
                sent = self.sent,
                expected = self.expected,
                "client disconnected"
            );
        }
    }
}
