use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{BackendConnector, BackendError, ChunkStream, MediaInfo, ObjectRef, RemoteBackend};

/// Backend serving a local media tree laid out as `<root>/<chat_id>/<message_id>.<ext>`
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Find the file backing an object
async fn locate(root: &Path, object: ObjectRef) -> Result<PathBuf, BackendError> {
    let chat_dir = root.join(object.chat_id.to_string());
    let wanted = object.message_id.to_string();

    let mut entries = match tokio::fs::read_dir(&chat_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendError::NotFound(object))
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem == wanted)
            .unwrap_or(false);
        if matches && entry.file_type().await?.is_file() {
            return Ok(path);
        }
    }

    Err(BackendError::NotFound(object))
}

/// Guess the MIME type from the file extension
fn mime_for(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "ts" => "video/mp2t",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Stable id derived from the file's location, size and modification time
fn file_id_for(path: &Path, size: u64, modified_secs: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(size.to_be_bytes());
    hasher.update(modified_secs.to_be_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn read_chunks(
    file: File,
    length: u64,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, BackendError>> + Send {
    stream::try_unfold((file, length), move |(mut file, remaining)| async move {
        if remaining == 0 {
            return Ok::<_, BackendError>(None);
        }
        let want = remaining.min(chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok::<_, BackendError>(None);
        }
        buf.truncate(read);
        Ok(Some((Bytes::from(buf), (file, remaining - read as u64))))
    })
}

#[async_trait]
impl RemoteBackend for DirectoryBackend {
    async fn resolve_size(&self, object: ObjectRef) -> Result<u64, BackendError> {
        Ok(self.media_info(object).await?.size)
    }

    async fn media_info(&self, object: ObjectRef) -> Result<MediaInfo, BackendError> {
        let path = locate(&self.root, object).await?;
        let metadata = tokio::fs::metadata(&path).await?;
        let size = metadata.len();
        if size == 0 {
            return Err(BackendError::UnknownSize(object));
        }
        let modified_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(MediaInfo {
            file_id: file_id_for(&path, size, modified_secs),
            size,
            mime_type: mime_for(&path),
        })
    }

    fn fetch_chunk(
        &self,
        object: ObjectRef,
        offset: u64,
        length: u64,
        chunk_size: usize,
    ) -> ChunkStream {
        let root = self.root.clone();
        let located = async move { locate(&root, object).await };

        stream::once(located)
            .map_ok(move |path| read_file_range(path, offset, length, chunk_size))
            .try_flatten()
            .boxed()
    }
}

/// Stream `length` bytes of a local file starting at `offset`
pub(crate) fn read_file_range(
    path: PathBuf,
    offset: u64,
    length: u64,
    chunk_size: usize,
) -> ChunkStream {
    let chunk_size = chunk_size.max(1);
    let opened = async move {
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok::<_, BackendError>(file)
    };

    stream::once(opened)
        .map_ok(move |file| read_chunks(file, length, chunk_size))
        .try_flatten()
        .boxed()
}

/// Connector for `DirectoryBackend`; the media root must exist
#[derive(Debug, Clone)]
pub struct DirectoryConnector {
    root: PathBuf,
    session_path: Option<PathBuf>,
}

impl DirectoryConnector {
    pub fn new(root: PathBuf, session_path: Option<PathBuf>) -> Self {
        Self { root, session_path }
    }
}

#[async_trait]
impl BackendConnector for DirectoryConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteBackend>, BackendError> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            BackendError::Transport(format!(
                "media root {} is not accessible: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(BackendError::Transport(format!(
                "media root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(Arc::new(DirectoryBackend::new(self.root.clone())))
    }

    fn session_path(&self) -> Option<PathBuf> {
        self.session_path.clone()
    }
}
