use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::health::health_handler;
use super::range::parse_range;
use super::relay::{ActiveTees, Relay, Tee};
use crate::app::GatewayConfig;
use crate::backend::{read_file_range, BackendError, MediaInfo, ObjectRef, RemoteBackend};
use crate::cache::CacheStore;
use crate::constants::GATEWAY_SHUTDOWN_GRACE_MS;
use crate::utils::StreamError;

/// What the caller gets back for a registered object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub token: String,
    pub url: String,
    pub object: ObjectRef,
    pub size: u64,
    pub content_type: String,
    /// Advisory: false when the player will likely need to seek to the end first
    pub front_loaded: bool,
}

struct Registration {
    object: ObjectRef,
    media: MediaInfo,
    last_used: Instant,
}

/// State shared with the request handlers
struct GatewayState {
    backend: Arc<dyn RemoteBackend>,
    cache: Option<Arc<CacheStore>>,
    persist_full_downloads: bool,
    chunk_size: usize,
    registry: RwLock<HashMap<String, Registration>>,
    active_tees: ActiveTees,
}

impl GatewayState {
    /// Look up a token and mark it used
    fn touch(&self, token: &str) -> Option<(ObjectRef, MediaInfo)> {
        let mut registry = self.registry.write();
        let registration = registry.get_mut(token)?;
        registration.last_used = Instant::now();
        Some((registration.object, registration.media.clone()))
    }

    async fn cached_blob(&self, media: &MediaInfo) -> Option<PathBuf> {
        let cache = self.cache.clone()?;
        let file_id = media.file_id.clone();

        match tokio::task::spawn_blocking(move || cache.lookup(&file_id)).await {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                warn!(file_id = %media.file_id, error = %e, "cache lookup failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "cache lookup task failed");
                None
            }
        }
    }

    async fn open_relay(
        &self,
        token: &str,
        object: ObjectRef,
        media: &MediaInfo,
        start: u64,
        length: u64,
        whole_object: bool,
    ) -> Relay {
        if let Some(path) = self.cached_blob(media).await {
            debug!(token, file_id = %media.file_id, start, length, "serving from cache");
            let chunks = read_file_range(path, start, length, self.chunk_size);
            return Relay::new(token.to_string(), chunks, length, None);
        }

        let chunks = self.backend.fetch_chunk(object, start, length, self.chunk_size);
        let tee = match &self.cache {
            Some(cache) if self.persist_full_downloads && whole_object => {
                Tee::create(cache.clone(), self.active_tees.clone(), object, media).await
            }
            _ => None,
        };
        debug!(token, %object, start, length, caching = tee.is_some(), "relaying from remote");
        Relay::new(token.to_string(), chunks, length, tee)
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Local HTTP server that turns stream tokens into range-servable responses
pub struct StreamingGateway {
    host: String,
    port: u16,
    idle_timeout: Option<Duration>,
    state: Arc<GatewayState>,
    next_token: AtomicU64,
    server: Option<RunningServer>,
}

impl StreamingGateway {
    pub fn new(
        config: &GatewayConfig,
        backend: Arc<dyn RemoteBackend>,
        cache: Option<Arc<CacheStore>>,
        persist_full_downloads: bool,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            idle_timeout: config.idle_timeout(),
            state: Arc::new(GatewayState {
                backend,
                cache,
                persist_full_downloads,
                chunk_size: config.chunk_size.max(1),
                registry: RwLock::new(HashMap::new()),
                active_tees: ActiveTees::default(),
            }),
            next_token: AtomicU64::new(1),
            server: None,
        }
    }

    /// Bind and start serving. Returns the bound address; calling it again
    /// while running is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr, StreamError> {
        if let Some(server) = &self.server {
            return Ok(server.addr);
        }

        let bind_addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| StreamError::GatewayBind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| StreamError::GatewayBind {
                addr: bind_addr,
                source,
            })?;

        let app = router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "gateway server error");
            }
        });

        info!(%addr, "streaming gateway listening");
        self.server = Some(RunningServer {
            addr,
            shutdown_tx,
            task,
        });
        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    pub fn base_url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{}", addr))
    }

    /// Hand out a token for an object whose size is already known
    pub fn register(&self, object: ObjectRef, media: MediaInfo) -> Result<StreamHandle, StreamError> {
        let base_url = self.base_url().ok_or(StreamError::GatewayNotStarted)?;
        if media.size == 0 {
            return Err(BackendError::UnknownSize(object).into());
        }

        let seq = self.next_token.fetch_add(1, Ordering::Relaxed);
        let token = format!("{:x}-{}-{}", seq, object.chat_id, object.message_id);
        let handle = StreamHandle {
            url: format!("{}/stream/{}", base_url, token),
            token: token.clone(),
            object,
            size: media.size,
            content_type: media.content_type().to_string(),
            front_loaded: true,
        };

        self.state.registry.write().insert(
            token,
            Registration {
                object,
                media,
                last_used: Instant::now(),
            },
        );
        debug!(token = %handle.token, %object, size = handle.size, "stream registered");
        Ok(handle)
    }

    /// Forget a token. Responses already in flight keep going.
    pub fn release(&self, token: &str) -> bool {
        let removed = self.state.registry.write().remove(token).is_some();
        if removed {
            debug!(token, "stream released");
        }
        removed
    }

    /// Drop tokens unused for longer than the idle timeout
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub(crate) fn evict_idle_at(&self, now: Instant) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };

        let mut registry = self.state.registry.write();
        let before = registry.len();
        registry.retain(|_, reg| now.saturating_duration_since(reg.last_used) < timeout);
        let evicted = before - registry.len();
        if evicted > 0 {
            debug!(evicted, "idle stream tokens dropped");
        }
        evicted
    }

    pub fn registration_count(&self) -> usize {
        self.state.registry.read().len()
    }

    /// Close the listener and forget every token. Safe when never started.
    pub async fn stop(&mut self) {
        self.state.registry.write().clear();

        let Some(server) = self.server.take() else {
            return;
        };
        let _ = server.shutdown_tx.send(());

        // Open streams keep graceful shutdown pending; don't wait for them
        let mut task = server.task;
        if tokio::time::timeout(Duration::from_millis(GATEWAY_SHUTDOWN_GRACE_MS), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        info!(addr = %server.addr, "streaming gateway stopped");
    }
}

fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/stream/{token}", get(stream_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET|HEAD /stream/{token}`
async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some((object, media)) = state.touch(&token) else {
        debug!(%token, "unknown stream token");
        return (StatusCode::NOT_FOUND, "Unknown stream token").into_response();
    };

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let Some(range) = parse_range(range_header, media.size) else {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", media.size))],
        )
            .into_response();
    };

    let status = if range.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, media.content_type())
        .header(header::CONTENT_LENGTH, range.length())
        .header(header::ACCEPT_RANGES, "bytes");
    if range.partial {
        builder = builder.header(header::CONTENT_RANGE, range.content_range(media.size));
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        debug!(%token, start = range.start, end = range.end, "stream request");
        state
            .open_relay(
                &token,
                object,
                &media,
                range.start,
                range.length(),
                range.covers(media.size),
            )
            .await
            .into_body()
    };

    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to build stream response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}
