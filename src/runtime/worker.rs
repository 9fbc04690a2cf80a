use bytes::Bytes;
use futures::{FutureExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::task::{Callback, Envelope, Operation, OperationOutput, RuntimeStatus, Task, TaskResult};
use crate::app::{Config, GatewayConfig, RuntimeConfig};
use crate::backend::{BackendConnector, BackendError, ObjectRef, RemoteBackend};
use crate::cache::{CacheSettings, CacheStatus, CacheStore};
use crate::constants::RUNTIME_THREAD_NAME;
use crate::proxy::{MoovAtomHandler, StreamHandle, StreamingGateway};
use crate::utils::StreamError;

type Completion = (u64, TaskResult);

/// A running loop thread
struct LoopHandle {
    queue: mpsc::UnboundedSender<Envelope>,
    /// Flipped by `stop` so an in-flight task is abandoned
    cancel: watch::Sender<bool>,
    thread: JoinHandle<()>,
    exit_rx: std_mpsc::Receiver<()>,
    base_url: String,
}

/// Owns one background thread running a single cooperative event loop.
///
/// The loop owns the backend connection and the streaming gateway. Any
/// thread may submit work with [`execute`](Self::execute); results come back
/// through callbacks that run on whichever thread calls
/// [`dispatch_pending`](Self::dispatch_pending) or
/// [`wait_dispatch`](Self::wait_dispatch), never on the loop thread.
pub struct WorkerRuntime {
    gateway_config: GatewayConfig,
    runtime_config: RuntimeConfig,
    persist_full_downloads: bool,
    connector: Arc<dyn BackendConnector>,
    cache: Arc<CacheStore>,

    next_callback_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Callback>>,
    completion_tx: std_mpsc::Sender<Completion>,
    completion_rx: Mutex<std_mpsc::Receiver<Completion>>,

    /// Submission side of the live loop, separate from the lifecycle lock
    /// so `execute` never waits on a slow `start`
    queue: RwLock<Option<mpsc::UnboundedSender<Envelope>>>,
    lifecycle: Mutex<Option<LoopHandle>>,
}

impl WorkerRuntime {
    pub fn new(config: &Config, connector: Arc<dyn BackendConnector>, cache: Arc<CacheStore>) -> Self {
        let (completion_tx, completion_rx) = std_mpsc::channel();
        Self {
            gateway_config: config.gateway.clone(),
            runtime_config: config.runtime.clone(),
            persist_full_downloads: config.cache.persist_full_downloads,
            connector,
            cache,
            next_callback_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            queue: RwLock::new(None),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Spawn the loop thread and wait until the backend is connected and the
    /// gateway is listening. Returns the gateway base URL. Idempotent.
    pub fn start(&self) -> Result<String, StreamError> {
        let mut lifecycle = self.lifecycle.lock();

        if let Some(handle) = lifecycle.as_ref() {
            if !handle.thread.is_finished() {
                return Ok(handle.base_url.clone());
            }
        }
        // Loop ended on its own (shutdown task); reap it before restarting
        if let Some(old) = lifecycle.take() {
            let _ = old.thread.join();
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (exit_tx, exit_rx) = std_mpsc::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let event_loop = EventLoop {
            gateway_config: self.gateway_config.clone(),
            runtime_config: self.runtime_config.clone(),
            persist_full_downloads: self.persist_full_downloads,
            connector: self.connector.clone(),
            cache: self.cache.clone(),
            completions: self.completion_tx.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(RUNTIME_THREAD_NAME.to_string())
            .spawn(move || {
                event_loop.run_blocking(queue_rx, cancel_rx, ready_tx);
                let _ = exit_tx.send(());
            })
            .map_err(|e| StreamError::Startup(format!("cannot spawn worker thread: {}", e)))?;

        let timeout = self.runtime_config.startup_timeout();
        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(base_url)) => {
                *self.queue.write() = Some(queue_tx.clone());
                *lifecycle = Some(LoopHandle {
                    queue: queue_tx,
                    cancel: cancel_tx,
                    thread,
                    exit_rx,
                    base_url: base_url.clone(),
                });
                info!(%base_url, "worker runtime started");
                Ok(base_url)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                // The loop stops itself once it gets this far
                let _ = cancel_tx.send(true);
                let _ = queue_tx.send(Envelope::Stop);
                Err(StreamError::Startup(format!(
                    "no ready signal within {:?}",
                    timeout
                )))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(StreamError::Startup("worker thread exited during startup".to_string()))
            }
        }
    }

    /// Ask the loop to exit and wait up to the stop timeout. Never hangs:
    /// a loop that does not exit in time is detached. Pending callbacks are
    /// delivered or failed before this returns. No-op when not started.
    pub fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            self.queue.write().take();
            lifecycle.take()
        };

        if let Some(handle) = handle {
            let _ = handle.cancel.send(true);
            let _ = handle.queue.send(Envelope::Stop);
            let timeout = self.runtime_config.stop_timeout();
            match handle.exit_rx.recv_timeout(timeout) {
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    warn!(?timeout, "worker thread did not exit in time, detaching it");
                }
                _ => {
                    let _ = handle.thread.join();
                    info!("worker runtime stopped");
                }
            }
        }

        self.dispatch_pending();
        self.fail_pending(&StreamError::NotRunning.to_string());
    }

    pub fn is_running(&self) -> bool {
        self.queue
            .read()
            .as_ref()
            .map(|queue| !queue.is_closed())
            .unwrap_or(false)
    }

    pub fn base_url(&self) -> Option<String> {
        if !self.is_running() {
            return None;
        }
        self.lifecycle.lock().as_ref().map(|h| h.base_url.clone())
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            running: self.is_running(),
            base_url: self.base_url(),
            pending_callbacks: self.callbacks.lock().len(),
        }
    }

    /// Queue an operation. Never blocks. The callback runs exactly once; if
    /// the runtime is not running it runs immediately with a failure.
    /// Returns the callback id.
    pub fn execute<F>(&self, operation: Operation, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        let name = operation.name();

        let sender = self.queue.read().clone();
        let Some(sender) = sender else {
            debug!(id, operation = name, "runtime not running, failing task");
            callback(Err(StreamError::NotRunning.to_string()));
            return id;
        };

        self.callbacks.lock().insert(id, Box::new(callback));
        if sender.send(Envelope::Task(Task { id, operation })).is_err() {
            let callback = self.callbacks.lock().remove(&id);
            if let Some(callback) = callback {
                callback(Err(StreamError::NotRunning.to_string()));
            }
        } else {
            debug!(id, operation = name, "task queued");
        }
        id
    }

    pub fn prepare_stream<F>(&self, object: ObjectRef, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::PrepareStream { object }, callback)
    }

    pub fn release_stream<F>(&self, token: impl Into<String>, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::ReleaseStream { token: token.into() }, callback)
    }

    pub fn update_cache_settings<F>(&self, settings: CacheSettings, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::UpdateCacheSettings { settings }, callback)
    }

    pub fn clear_cache<F>(&self, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::ClearCache, callback)
    }

    pub fn cache_status<F>(&self, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::CacheStatus, callback)
    }

    pub fn shutdown<F>(&self, callback: F) -> u64
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.execute(Operation::Shutdown, callback)
    }

    /// Run the callbacks of every finished task. Returns how many ran.
    pub fn dispatch_pending(&self) -> usize {
        let completions: Vec<Completion> = self.completion_rx.lock().try_iter().collect();
        self.deliver(completions)
    }

    /// Like `dispatch_pending`, but waits up to `timeout` for the first
    /// completion when none is ready yet.
    pub fn wait_dispatch(&self, timeout: Duration) -> usize {
        let completions: Vec<Completion> = {
            let rx = self.completion_rx.lock();
            match rx.recv_timeout(timeout) {
                Ok(first) => std::iter::once(first).chain(rx.try_iter()).collect(),
                Err(_) => Vec::new(),
            }
        };
        self.deliver(completions)
    }

    /// Submit and wait for the result on this thread, dispatching other
    /// completions along the way.
    pub fn call(&self, operation: Operation, timeout: Duration) -> TaskResult {
        let name = operation.name();
        let (tx, rx) = std_mpsc::channel();
        self.execute(operation, move |result| {
            let _ = tx.send(result);
        });

        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(result) = rx.try_recv() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!("{} timed out after {:?}", name, timeout));
            }
            self.wait_dispatch(deadline - now);
        }
    }

    fn deliver(&self, completions: Vec<Completion>) -> usize {
        let mut delivered = 0;
        for (id, result) in completions {
            // Never hold the map lock while user code runs
            let callback = self.callbacks.lock().remove(&id);
            match callback {
                Some(callback) => {
                    callback(result);
                    delivered += 1;
                }
                None => debug!(id, "completion without a callback"),
            }
        }
        delivered
    }

    fn fail_pending(&self, reason: &str) {
        let orphaned: Vec<Callback> = self.callbacks.lock().drain().map(|(_, cb)| cb).collect();
        if !orphaned.is_empty() {
            debug!(count = orphaned.len(), "failing callbacks left after stop");
        }
        for callback in orphaned {
            callback(Err(reason.to_string()));
        }
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the loop thread owns
struct EventLoop {
    gateway_config: GatewayConfig,
    runtime_config: RuntimeConfig,
    persist_full_downloads: bool,
    connector: Arc<dyn BackendConnector>,
    cache: Arc<CacheStore>,
    completions: std_mpsc::Sender<Completion>,
}

impl EventLoop {
    fn run_blocking(
        self,
        queue_rx: mpsc::UnboundedReceiver<Envelope>,
        cancel_rx: watch::Receiver<bool>,
        ready_tx: std_mpsc::Sender<Result<String, StreamError>>,
    ) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ready_tx.send(Err(StreamError::Startup(e.to_string())));
                return;
            }
        };

        rt.block_on(self.run(queue_rx, cancel_rx, ready_tx));
        // Cancels any response still relaying
        rt.shutdown_timeout(Duration::from_millis(500));
    }

    async fn run(
        self,
        mut queue_rx: mpsc::UnboundedReceiver<Envelope>,
        mut cancel_rx: watch::Receiver<bool>,
        ready_tx: std_mpsc::Sender<Result<String, StreamError>>,
    ) {
        let backend = match connect_backend(self.connector.as_ref()).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(error = %e, "backend connection failed");
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let mut gateway = StreamingGateway::new(
            &self.gateway_config,
            backend.clone(),
            Some(self.cache.clone()),
            self.persist_full_downloads,
        );
        let base_url = match gateway.start().await {
            Ok(addr) => format!("http://{}", addr),
            Err(e) => {
                error!(error = %e, "gateway failed to start");
                backend.disconnect().await;
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(base_url));

        let mut sweep = tokio::time::interval(self.runtime_config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        debug!("event loop running");
        loop {
            tokio::select! {
                biased;

                envelope = queue_rx.recv() => match envelope {
                    Some(Envelope::Task(task)) => {
                        let shutdown = matches!(task.operation, Operation::Shutdown);
                        let name = task.operation.name();
                        // A closed channel means the owning runtime is gone
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel_rx.wait_for(|cancelled| *cancelled) => None,
                            result = self.run_task(&mut gateway, &backend, task.operation) => Some(result),
                        };
                        let Some(result) = outcome else {
                            info!(id = task.id, operation = name, "stop requested, abandoning task");
                            let _ = self
                                .completions
                                .send((task.id, Err(StreamError::Cancelled.to_string())));
                            break;
                        };
                        if let Err(e) = &result {
                            debug!(id = task.id, error = %e, "task failed");
                        }
                        let _ = self.completions.send((task.id, result));
                        if shutdown {
                            info!("shutdown requested");
                            break;
                        }
                    }
                    Some(Envelope::Stop) | None => break,
                },

                _ = sweep.tick() => {
                    gateway.evict_idle();
                }
            }
        }

        gateway.stop().await;
        backend.disconnect().await;

        // Nothing new gets in after close; fail whatever was still queued
        queue_rx.close();
        while let Ok(envelope) = queue_rx.try_recv() {
            if let Envelope::Task(task) = envelope {
                let _ = self
                    .completions
                    .send((task.id, Err(StreamError::NotRunning.to_string())));
            }
        }
        debug!("event loop exited");
    }

    /// Run one task, turning errors and panics into the failure string
    async fn run_task(
        &self,
        gateway: &mut StreamingGateway,
        backend: &Arc<dyn RemoteBackend>,
        operation: Operation,
    ) -> TaskResult {
        let name = operation.name();
        match AssertUnwindSafe(self.dispatch(gateway, backend, operation))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(operation = name, %message, "task panicked");
                Err(StreamError::TaskPanicked(message).to_string())
            }
        }
    }

    async fn dispatch(
        &self,
        gateway: &mut StreamingGateway,
        backend: &Arc<dyn RemoteBackend>,
        operation: Operation,
    ) -> Result<OperationOutput, StreamError> {
        match operation {
            Operation::PrepareStream { object } => {
                let handle = self.prepare_stream(gateway, backend, object).await?;
                Ok(OperationOutput::Stream(handle))
            }
            Operation::ReleaseStream { token } => Ok(OperationOutput::StreamReleased(gateway.release(&token))),
            Operation::UpdateCacheSettings { settings } => {
                let cache = self.cache.clone();
                let bytes_freed = blocking(move || cache.update_settings(settings)).await?;
                Ok(OperationOutput::SettingsApplied { bytes_freed })
            }
            Operation::ClearCache => {
                let cache = self.cache.clone();
                let bytes_freed = blocking(move || cache.clear_all()).await?;
                Ok(OperationOutput::CacheCleared { bytes_freed })
            }
            Operation::CacheStatus => {
                let cache = self.cache.clone();
                let status = blocking(move || {
                    let stats = cache.stats()?;
                    let disk = match cache.get_disk_info() {
                        Ok(disk) => Some(disk),
                        Err(e) => {
                            debug!(error = %e, "disk info unavailable");
                            None
                        }
                    };
                    Ok(CacheStatus {
                        settings: cache.settings(),
                        stats,
                        disk,
                    })
                })
                .await?;
                Ok(OperationOutput::CacheStatus(status))
            }
            Operation::Shutdown => Ok(OperationOutput::ShuttingDown),
        }
    }

    async fn prepare_stream(
        &self,
        gateway: &mut StreamingGateway,
        backend: &Arc<dyn RemoteBackend>,
        object: ObjectRef,
    ) -> Result<StreamHandle, StreamError> {
        let media = backend.media_info(object).await?;

        let front_loaded = if self.runtime_config.probe_container_layout && media.is_mp4_like() {
            probe_layout(backend, object, media.size).await
        } else {
            true
        };

        let mut handle = gateway.register(object, media)?;
        handle.front_loaded = front_loaded;
        if !front_loaded {
            warn!(%object, "moov box is at the end of the file, playback may start slowly");
        }
        info!(%object, size = handle.size, url = %handle.url, "stream ready");
        Ok(handle)
    }
}

/// Run cache I/O off the loop thread
async fn blocking<T, F>(f: F) -> Result<T, StreamError>
where
    F: FnOnce() -> Result<T, crate::cache::CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StreamError::TaskPanicked(e.to_string()))?
        .map_err(StreamError::from)
}

/// Advisory; any read failure counts as front-loaded
async fn probe_layout(backend: &Arc<dyn RemoteBackend>, object: ObjectRef, size: u64) -> bool {
    let read = |offset: u64, len: usize| {
        let backend = backend.clone();
        async move {
            let parts: Vec<Bytes> = backend
                .fetch_chunk(object, offset, len as u64, len.max(1))
                .try_collect()
                .await?;
            Ok::<_, BackendError>(Bytes::from(parts.concat()))
        }
    };

    match MoovAtomHandler::find_moov_position(read, size).await {
        Ok(position) => {
            debug!(%object, ?position, "container layout probed");
            MoovAtomHandler::is_front_loaded(position)
        }
        Err(e) => {
            debug!(%object, error = %e, "layout probe failed");
            true
        }
    }
}

/// Connect, repairing a corrupt local session once
async fn connect_backend(connector: &dyn BackendConnector) -> Result<Arc<dyn RemoteBackend>, StreamError> {
    match connector.connect().await {
        Ok(backend) => Ok(backend),
        Err(e) if e.is_corrupt_session() => {
            warn!(error = %e, "backend session is corrupt, discarding it and reconnecting");
            if let Some(path) = connector.session_path() {
                remove_session(&path).await;
            }
            connector.connect().await.map_err(|e| {
                StreamError::Startup(format!("reconnect after session repair failed: {}", e))
            })
        }
        Err(e) => Err(StreamError::Startup(e.to_string())),
    }
}

async fn remove_session(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => info!(path = %path.display(), "corrupt session removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove session"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryConnector};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.gateway.port = 0;
        config.gateway.chunk_size = 1000;
        config.runtime.startup_timeout_ms = 5_000;
        config.runtime.stop_timeout_ms = 2_000;
        config
    }

    fn runtime_with(connector: MemoryConnector) -> (TempDir, WorkerRuntime) {
        let temp_dir = TempDir::new().unwrap();
        let cache = Arc::new(
            CacheStore::open(temp_dir.path().join("cache"), CacheSettings::default()).unwrap(),
        );
        let runtime = WorkerRuntime::new(&test_config(), Arc::new(connector), cache);
        (temp_dir, runtime)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn client_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn prepared(runtime: &WorkerRuntime, object: ObjectRef) -> StreamHandle {
        match runtime.call(Operation::PrepareStream { object }, WAIT) {
            Ok(OperationOutput::Stream(handle)) => handle,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_prepare_stream_and_fetch() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(-100, 1);
        let data = sample(5_000);
        backend.insert(object, data.clone(), Some("video/webm"));
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));

        let base_url = runtime.start().unwrap();
        assert!(runtime.is_running());
        let handle = prepared(&runtime, object);
        assert!(handle.url.starts_with(&base_url));
        assert_eq!(handle.size, 5_000);
        assert_eq!(handle.content_type, "video/webm");

        let rt = client_runtime();
        let body = rt.block_on(async {
            reqwest::Client::new()
                .get(&handle.url)
                .header("Range", "bytes=100-199")
                .send()
                .await
                .unwrap()
                .bytes()
                .await
                .unwrap()
        });
        assert_eq!(body.to_vec(), data[100..200].to_vec());

        runtime.stop();
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_callbacks_run_on_the_dispatching_thread() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(1, 1);
        backend.insert(object, sample(10), None);
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();

        let caller = std::thread::current().id();
        let (tx, rx) = std_mpsc::channel();
        runtime.prepare_stream(object, move |result| {
            tx.send((std::thread::current().id(), result.is_ok())).unwrap();
        });

        let deadline = Instant::now() + WAIT;
        while runtime.dispatch_pending() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let (thread, ok) = rx.try_recv().unwrap();
        assert_eq!(thread, caller);
        assert!(ok);

        runtime.stop();
    }

    #[test]
    fn test_failures_reach_the_callback() {
        let (_dir, runtime) = runtime_with(MemoryConnector::new(MemoryBackend::new()));
        runtime.start().unwrap();

        let result = runtime.call(
            Operation::PrepareStream {
                object: ObjectRef::new(404, 404),
            },
            WAIT,
        );
        let message = result.unwrap_err();
        assert!(message.contains("404/404"), "{}", message);

        // The loop survives and keeps serving
        assert!(matches!(
            runtime.call(Operation::CacheStatus, WAIT),
            Ok(OperationOutput::CacheStatus(_))
        ));
        runtime.stop();
    }

    #[test]
    fn test_callback_ids_increase_and_each_runs_once() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(2, 2);
        backend.insert(object, sample(10), None);
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut last_id = 0;
        for _ in 0..20 {
            let calls = calls.clone();
            let id = runtime.cache_status(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            assert!(id > last_id);
            last_id = id;
        }

        let deadline = Instant::now() + WAIT;
        while calls.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            runtime.wait_dispatch(Duration::from_millis(50));
        }
        runtime.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(runtime.status().pending_callbacks, 0);
    }

    #[test]
    fn test_execute_when_not_running_fails_immediately() {
        let (_dir, runtime) = runtime_with(MemoryConnector::new(MemoryBackend::new()));

        let (tx, rx) = std_mpsc::channel();
        runtime.clear_cache(move |result| tx.send(result).unwrap());
        let result = rx.try_recv().unwrap();
        assert_eq!(result, Err(StreamError::NotRunning.to_string()));
    }

    #[test]
    fn test_stop_before_start_and_double_stop() {
        let (_dir, runtime) = runtime_with(MemoryConnector::new(MemoryBackend::new()));
        runtime.stop();
        assert!(!runtime.is_running());

        runtime.start().unwrap();
        let started = Instant::now();
        runtime.stop();
        runtime.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_stop_abandons_a_slow_task() {
        let backend = MemoryBackend::new().with_chunk_delay(Duration::from_secs(4));
        let object = ObjectRef::new(8, 8);
        backend.insert(object, sample(4_000), Some("video/mp4"));
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        let base_url = runtime.start().unwrap();

        let (tx, rx) = std_mpsc::channel();
        runtime.prepare_stream(object, move |result| tx.send(result).unwrap());
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        runtime.stop();
        // Well under the stop timeout, so the loop exited instead of being detached
        assert!(started.elapsed() < Duration::from_millis(1_500), "took {:?}", started.elapsed());

        assert_eq!(rx.try_recv().unwrap(), Err(StreamError::Cancelled.to_string()));
        let rt = client_runtime();
        assert!(!rt.block_on(crate::proxy::is_gateway_running(&base_url)));

        // Restarting works after an abandoned task
        runtime.start().unwrap();
        runtime.stop();
    }

    #[test]
    fn test_start_is_idempotent_and_restartable() {
        let connector = MemoryConnector::new(MemoryBackend::new());
        let (_dir, runtime) = runtime_with(connector);

        let first = runtime.start().unwrap();
        assert_eq!(runtime.start().unwrap(), first);
        runtime.stop();

        runtime.start().unwrap();
        assert!(runtime.is_running());
        runtime.stop();
    }

    #[test]
    fn test_shutdown_operation_stops_the_loop() {
        let (_dir, runtime) = runtime_with(MemoryConnector::new(MemoryBackend::new()));
        runtime.start().unwrap();

        assert_eq!(runtime.call(Operation::Shutdown, WAIT), Ok(OperationOutput::ShuttingDown));

        let deadline = Instant::now() + WAIT;
        while runtime.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!runtime.is_running());
        assert!(runtime.call(Operation::CacheStatus, WAIT).is_err());
        runtime.stop();
    }

    #[test]
    fn test_corrupt_session_is_removed_and_retried() {
        let temp_dir = TempDir::new().unwrap();
        let session = temp_dir.path().join("session.db");
        std::fs::write(&session, b"garbage").unwrap();

        let connector = Arc::new(
            MemoryConnector::new(MemoryBackend::new())
                .with_session_path(session.clone())
                .fail_next(BackendError::Transport(
                    "database disk image is malformed".to_string(),
                )),
        );
        let cache = Arc::new(
            CacheStore::open(temp_dir.path().join("cache"), CacheSettings::default()).unwrap(),
        );
        let runtime = WorkerRuntime::new(&test_config(), connector.clone(), cache);

        runtime.start().unwrap();
        assert!(!session.exists());
        assert_eq!(connector.attempts(), 2);
        runtime.stop();
    }

    #[test]
    fn test_other_connect_errors_are_fatal() {
        let connector = MemoryConnector::new(MemoryBackend::new())
            .fail_next(BackendError::Transport("connection refused".to_string()));
        let (_dir, runtime) = runtime_with(connector);

        let err = runtime.start().unwrap_err();
        assert!(matches!(err, StreamError::Startup(_)));
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_repeated_corruption_is_fatal() {
        let connector = MemoryConnector::new(MemoryBackend::new())
            .fail_next(BackendError::CorruptSession("first".into()))
            .fail_next(BackendError::CorruptSession("second".into()));
        let (_dir, runtime) = runtime_with(connector);

        assert!(runtime.start().is_err());
    }

    #[test]
    fn test_cache_operations() {
        let (_dir, runtime) = runtime_with(MemoryConnector::new(MemoryBackend::new()));
        runtime.start().unwrap();

        let settings = CacheSettings {
            size_limit_bytes: 1024,
            retention_seconds: -1,
            auto_cleanup_enabled: true,
        };
        assert_eq!(
            runtime.call(Operation::UpdateCacheSettings { settings }, WAIT),
            Ok(OperationOutput::SettingsApplied { bytes_freed: 0 })
        );
        assert_eq!(runtime.cache().settings(), settings);

        match runtime.call(Operation::CacheStatus, WAIT) {
            Ok(OperationOutput::CacheStatus(status)) => {
                assert_eq!(status.settings, settings);
                assert_eq!(status.stats.file_count, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(
            runtime.call(Operation::ClearCache, WAIT),
            Ok(OperationOutput::CacheCleared { bytes_freed: 0 })
        );
        runtime.stop();
    }

    #[test]
    fn test_release_stream() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(3, 3);
        backend.insert(object, sample(10), None);
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();

        let handle = prepared(&runtime, object);
        assert_eq!(
            runtime.call(Operation::ReleaseStream { token: handle.token.clone() }, WAIT),
            Ok(OperationOutput::StreamReleased(true))
        );
        assert_eq!(
            runtime.call(Operation::ReleaseStream { token: handle.token }, WAIT),
            Ok(OperationOutput::StreamReleased(false))
        );
        runtime.stop();
    }

    #[test]
    fn test_back_loaded_mp4_is_reported() {
        let backend = MemoryBackend::new();
        let object = ObjectRef::new(4, 4);
        let mut file = Vec::new();
        file.extend_from_slice(&16u32.to_be_bytes());
        file.extend_from_slice(b"ftyp");
        file.extend_from_slice(&[0u8; 8]);
        let mdat_len = 200 * 1024 + 8;
        file.extend_from_slice(&(mdat_len as u32).to_be_bytes());
        file.extend_from_slice(b"mdat");
        file.extend(std::iter::repeat(0u8).take(mdat_len - 8));
        file.extend_from_slice(&16u32.to_be_bytes());
        file.extend_from_slice(b"moov");
        file.extend_from_slice(&[0u8; 8]);
        backend.insert(object, file, Some("video/mp4"));
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();

        let handle = prepared(&runtime, object);
        assert!(!handle.front_loaded);
        runtime.stop();
    }

    #[test]
    fn test_task_completes_while_streams_relay() {
        let backend = MemoryBackend::new().with_chunk_delay(Duration::from_millis(20));
        let objects: Vec<ObjectRef> = (0..10).map(|i| ObjectRef::new(7, i)).collect();
        for object in &objects {
            backend.insert(*object, sample(2_000_000), Some("video/webm"));
        }
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();
        let handles: Vec<StreamHandle> = objects.iter().map(|o| prepared(&runtime, *o)).collect();

        let rt = client_runtime();
        let (first_bytes_tx, first_bytes_rx) = std_mpsc::channel();
        for handle in &handles {
            let url = handle.url.clone();
            let first_bytes_tx = first_bytes_tx.clone();
            rt.spawn(async move {
                let mut response = reqwest::Client::new().get(&url).send().await.unwrap();
                let mut signalled = false;
                while let Ok(Some(_)) = response.chunk().await {
                    if !signalled {
                        let _ = first_bytes_tx.send(());
                        signalled = true;
                    }
                }
            });
        }
        for _ in 0..handles.len() {
            first_bytes_rx.recv_timeout(WAIT).unwrap();
        }

        let started = Instant::now();
        let result = runtime.call(Operation::CacheStatus, WAIT);
        let elapsed = started.elapsed();

        assert!(matches!(result, Ok(OperationOutput::CacheStatus(_))));
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);

        rt.shutdown_background();
        runtime.stop();
    }

    #[test]
    fn test_stop_fails_queued_callbacks() {
        let backend = MemoryBackend::new().with_chunk_delay(Duration::from_millis(10));
        let (_dir, runtime) = runtime_with(MemoryConnector::new(backend));
        runtime.start().unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..50 {
            let results = results.clone();
            runtime.cache_status(move |result| results.lock().push(result.is_ok()));
        }
        runtime.stop();

        // Every callback ran exactly once, successfully or not
        assert_eq!(results.lock().len(), 50);
        assert_eq!(runtime.status().pending_callbacks, 0);
    }
}
