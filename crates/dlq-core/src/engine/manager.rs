//! Download engine - admits records and supervises transfer workers
//!
//! The engine owns:
//! - A semaphore bounding concurrent transfers
//! - The map of active workers with their cancellation tokens
//! - The connectivity input that pauses and resumes transfers
//! - The event broadcaster

use crate::engine::transfer::{Transfer, TransferContext};
use crate::error::DlqError;
use crate::store::{DownloadStore, RecordUpdate};
use dlq_types::{
    CoreEvent, DownloadId, DownloadQuery, DownloadRecord, DownloadRequest, DownloadStatus,
    Settings, StatusFilter,
};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Admission is re-checked at least this often
const DISPATCH_TICK: Duration = Duration::from_secs(1);

/// Network availability as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Handle to a running transfer worker
struct ActiveTransfer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    ctx: Arc<TransferContext>,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<DownloadId, ActiveTransfer>>,
    wake: Notify,
    connectivity: watch::Sender<Connectivity>,
}

/// Engine that moves records through PENDING -> RUNNING -> terminal states
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    /// Create an engine over `store`. Partial files go to `temp_dir`.
    pub fn new(
        store: DownloadStore,
        settings: Settings,
        temp_dir: PathBuf,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Result<Self, DlqError> {
        settings.validate()?;

        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|e| DlqError::Unknown(e.to_string()))?;

        let slots = Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1) as usize));
        let (connectivity, _) = watch::channel(Connectivity::Online);

        Ok(Self {
            inner: Arc::new(EngineInner {
                ctx: Arc::new(TransferContext {
                    store,
                    client,
                    settings,
                    temp_dir,
                    event_tx,
                }),
                slots,
                active: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                connectivity,
            }),
        })
    }

    pub fn store(&self) -> &DownloadStore {
        &self.inner.ctx.store
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.ctx.settings
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.ctx.event_tx.subscribe()
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.inner.connectivity.borrow()
    }

    /// Number of transfers currently holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Create a PENDING record and wake the dispatcher
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, DlqError> {
        let id = self.inner.ctx.store.enqueue(request).await?;
        let _ = self.inner.ctx.event_tx.send(CoreEvent::DownloadAdded { id });
        self.inner.wake.notify_one();
        Ok(id)
    }

    pub fn query(&self, query: &DownloadQuery) -> Vec<DownloadRecord> {
        self.inner.ctx.store.query(query)
    }

    /// Remove records, stopping their transfers and deleting their files.
    /// Unknown ids are skipped. Returns the number of records removed.
    pub async fn remove(&self, ids: &[DownloadId]) -> Result<usize, DlqError> {
        let ctx = &self.inner.ctx;
        let cancel_timeout = Duration::from_millis(ctx.settings.cancel_timeout_ms);
        let mut removed = 0;

        for &id in ids {
            if !ctx.store.retire(id) {
                debug!("Skipping removal of unknown download {}", id);
                continue;
            }

            let active = self.inner.active.lock().remove(&id);
            if let Some(mut active) = active {
                active.cancel.cancel();
                if tokio::time::timeout(cancel_timeout, &mut active.handle)
                    .await
                    .is_err()
                {
                    warn!(
                        "Transfer {} did not stop within {:?}, aborting",
                        id, cancel_timeout
                    );
                    active.handle.abort();
                }
            }

            for record in ctx.store.remove_records(&[id]).await? {
                discard_files(ctx, &record).await;
                let _ = ctx.event_tx.send(CoreEvent::DownloadRemoved { id: record.id });
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Feed a connectivity change. Going offline pauses every running
    /// transfer; coming back makes PAUSED records admissible again.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        let changed = self.inner.connectivity.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if !changed {
            return;
        }

        info!("Connectivity changed: {:?}", connectivity);
        let _ = self.inner.ctx.event_tx.send(CoreEvent::ConnectivityChanged {
            online: connectivity == Connectivity::Online,
        });

        match connectivity {
            Connectivity::Offline => {
                for transfer in self.inner.active.lock().values() {
                    transfer.cancel.cancel();
                }
            }
            Connectivity::Online => self.inner.wake.notify_one(),
        }
    }

    /// Dispatcher loop. Runs until `shutdown` is cancelled, then stops every
    /// worker; interrupted records are left PAUSED.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Download engine started ({} slots)",
            self.inner.ctx.settings.max_concurrent_downloads.max(1)
        );

        loop {
            self.dispatch().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(DISPATCH_TICK) => {}
            }
        }

        self.stop_all().await;
        info!("Download engine stopped");
    }

    /// True when nothing is running and nothing can be admitted
    pub fn is_idle(&self) -> bool {
        if !self.inner.active.lock().is_empty() {
            return false;
        }

        let waiting: StatusFilter = match self.connectivity() {
            Connectivity::Online => StatusFilter::active(),
            Connectivity::Offline => [DownloadStatus::Running].into_iter().collect(),
        };
        self.inner
            .ctx
            .store
            .query(&DownloadQuery::all().with_statuses(waiting))
            .is_empty()
    }

    /// Resolve once the engine is idle. Needs [`DownloadEngine::run`] to be
    /// driving admission.
    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Admit PENDING and PAUSED records in id order while slots are free
    async fn dispatch(&self) {
        if self.connectivity() == Connectivity::Offline {
            return;
        }

        let admissible: StatusFilter = [DownloadStatus::Pending, DownloadStatus::Paused]
            .into_iter()
            .collect();
        let candidates = self
            .inner
            .ctx
            .store
            .query(&DownloadQuery::all().with_statuses(admissible));

        for record in candidates {
            if self.inner.active.lock().contains_key(&record.id) {
                continue;
            }
            let permit = match self.inner.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.admit(record, permit).await;
        }
    }

    async fn admit(&self, record: DownloadRecord, permit: OwnedSemaphorePermit) {
        let id = record.id;
        let store = &self.inner.ctx.store;

        let lease = match store.lease(id) {
            Ok(lease) => lease,
            Err(_) => return,
        };
        let record = match store
            .update_leased(&lease, RecordUpdate::status(DownloadStatus::Running))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                debug!("Skipping admission of download {}: {}", id, e);
                return;
            }
        };
        self.inner.ctx.announce(&record);

        let cancel = CancellationToken::new();
        let transfer = Transfer::new(self.inner.ctx.clone(), record, lease, cancel.clone());
        let inner = self.inner.clone();

        // Held across spawn so the worker cannot deregister before it is registered
        let mut active = self.inner.active.lock();
        let handle = tokio::spawn(async move {
            transfer.run().await;
            drop(permit);
            inner.active.lock().remove(&id);
            inner.wake.notify_one();
        });
        if *self.inner.connectivity.borrow() == Connectivity::Offline {
            cancel.cancel();
        }
        active.insert(id, ActiveTransfer { cancel, handle });
    }

    async fn stop_all(&self) {
        let active: Vec<(DownloadId, ActiveTransfer)> = self.inner.active.lock().drain().collect();
        if active.is_empty() {
            return;
        }

        info!("Stopping {} active transfers", active.len());
        for (_, transfer) in &active {
            transfer.cancel.cancel();
        }

        let cancel_timeout = Duration::from_millis(self.inner.ctx.settings.cancel_timeout_ms);
        for (id, mut transfer) in active {
            if tokio::time::timeout(cancel_timeout, &mut transfer.handle)
                .await
                .is_err()
            {
                warn!("Transfer {} did not stop within {:?}, aborting", id, cancel_timeout);
                transfer.handle.abort();
                self.pause_aborted(id).await;
            }
        }
    }

    /// Record an aborted worker's progress the way it would have on cancel
    async fn pause_aborted(&self, id: DownloadId) {
        let ctx = &self.inner.ctx;
        let bytes = tokio::fs::metadata(ctx.part_path(id))
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        let mut update = RecordUpdate::status(DownloadStatus::Paused);
        update.bytes_downloaded = Some(bytes);
        match ctx.store.update_status(id, update).await {
            Ok(record) => ctx.announce(&record),
            Err(e) => debug!("Download {} not paused after abort: {}", id, e),
        }
    }
}

/// Delete the partial and completed files of a removed record
async fn discard_files(ctx: &TransferContext, record: &DownloadRecord) {
    let part = ctx.part_path(record.id);
    let files = std::iter::once(part).chain(record.local_path.clone());

    for path in files {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DownloadDatabase;
    use dlq_types::{Destination, NotificationVisibility, RetryConfig};
    use std::path::Path;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn engine(dir: &Path) -> DownloadEngine {
        let store = DownloadStore::open(DownloadDatabase::in_memory().await.unwrap())
            .await
            .unwrap();
        let settings = Settings {
            app_files_dir: dir.join("files"),
            public_dir: dir.join("public"),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            progress_interval_ms: 0,
            cancel_timeout_ms: 2_000,
            ..Settings::default()
        };
        let (event_tx, _) = broadcast::channel(256);
        DownloadEngine::new(store, settings, dir.join("temp"), event_tx).unwrap()
    }

    fn start(engine: &DownloadEngine) -> (CancellationToken, JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let runner = {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(shutdown).await })
        };
        (shutdown, runner)
    }

    async fn settle(engine: &DownloadEngine) {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
            .await
            .expect("engine did not go idle");
    }

    async fn wait_for_status(engine: &DownloadEngine, id: DownloadId, status: DownloadStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.store().get(id).map(|r| r.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("status not reached");
    }

    #[tokio::test]
    async fn downloads_into_app_files_dir() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let request = DownloadRequest::new(&format!("{}/file.bin", server.uri()))
            .unwrap()
            .with_destination(Destination::AppPrivate {
                dir_type: Some("Downloads".into()),
                sub_path: None,
            });
        let id = engine.enqueue(request).await.unwrap();
        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Pending);

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        let record = engine.store().get(id).unwrap();
        let expected = dir.path().join("files/Downloads/file.bin");
        assert_eq!(record.status, DownloadStatus::Successful);
        assert_eq!(record.local_path.as_deref(), Some(expected.as_path()));
        assert_eq!(record.bytes_downloaded, 11);
        assert_eq!(record.bytes_total, 11);
        assert_eq!(tokio::fs::read(&expected).await.unwrap(), b"hello world");
        assert!(!dir.path().join(format!("temp/{}.part", id)).exists());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/a.txt", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Successful);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/missing", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        let record = engine.store().get(id).unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert!(record.failure_reason.unwrap().contains("404"));
        assert_eq!(record.local_path, None);
    }

    #[tokio::test]
    async fn resume_sends_range_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=6-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 6-10/11")
                    .set_body_string("world"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/greeting.txt", server.uri())).unwrap())
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("temp")).await.unwrap();
        tokio::fs::write(dir.path().join(format!("temp/{}.part", id)), b"hello ")
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        let record = engine.store().get(id).unwrap();
        assert_eq!(record.status, DownloadStatus::Successful);
        assert_eq!(record.bytes_total, 11);
        let path = record.local_path.unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn full_response_to_range_restarts_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/greeting.txt", server.uri())).unwrap())
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("temp")).await.unwrap();
        tokio::fs::write(dir.path().join(format!("temp/{}.part", id)), b"stale bytes")
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        let path = engine.store().get(id).unwrap().local_path.unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_slots() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let store = DownloadStore::open(DownloadDatabase::in_memory().await.unwrap())
            .await
            .unwrap();
        let settings = Settings {
            app_files_dir: dir.path().join("files"),
            max_concurrent_downloads: 1,
            ..Settings::default()
        };
        let (event_tx, _) = broadcast::channel(256);
        let engine = DownloadEngine::new(store, settings, dir.path().join("temp"), event_tx).unwrap();

        let first = engine
            .enqueue(DownloadRequest::new(&format!("{}/1", server.uri())).unwrap())
            .await
            .unwrap();
        let second = engine
            .enqueue(DownloadRequest::new(&format!("{}/2", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        wait_for_status(&engine, first, DownloadStatus::Running).await;
        assert_eq!(engine.store().get(second).unwrap().status, DownloadStatus::Pending);

        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        for id in [first, second] {
            assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Successful);
        }
    }

    #[tokio::test]
    async fn remove_cancels_running_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("never")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let mut events = engine.subscribe();
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/big.iso", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        wait_for_status(&engine, id, DownloadStatus::Running).await;

        let removed = tokio::time::timeout(Duration::from_secs(5), engine.remove(&[id, 999]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed, 1);
        assert!(engine.query(&DownloadQuery::all()).is_empty());
        assert_eq!(engine.active_count(), 0);

        shutdown.cancel();
        runner.await.unwrap();

        let mut saw_removed = false;
        while let Ok(event) = events.try_recv() {
            if event == (CoreEvent::DownloadRemoved { id }) {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn remove_aborts_worker_after_cancel_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.iso"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("never")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/small.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_string("small"))
            .mount(&server)
            .await;

        let store = DownloadStore::open(DownloadDatabase::in_memory().await.unwrap())
            .await
            .unwrap();
        let settings = Settings {
            app_files_dir: dir.path().join("files"),
            max_concurrent_downloads: 1,
            cancel_timeout_ms: 0,
            ..Settings::default()
        };
        let (event_tx, _) = broadcast::channel(256);
        let engine = DownloadEngine::new(store, settings, dir.path().join("temp"), event_tx).unwrap();

        let big = engine
            .enqueue(DownloadRequest::new(&format!("{}/big.iso", server.uri())).unwrap())
            .await
            .unwrap();
        let (shutdown, runner) = start(&engine);
        wait_for_status(&engine, big, DownloadStatus::Running).await;

        assert_eq!(engine.remove(&[big]).await.unwrap(), 1);
        assert!(engine.query(&DownloadQuery::all()).is_empty());
        assert_eq!(engine.active_count(), 0);

        // The only slot was freed by the aborted worker
        let small = engine
            .enqueue(DownloadRequest::new(&format!("{}/small.bin", server.uri())).unwrap())
            .await
            .unwrap();
        wait_for_status(&engine, small, DownloadStatus::Successful).await;

        shutdown.cancel();
        runner.await.unwrap();

        let ids: Vec<_> = engine.query(&DownloadQuery::all()).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![small]);
        assert!(engine.store().get(big).is_none());
        assert!(!engine.inner.ctx.part_path(big).exists());
    }

    #[tokio::test]
    async fn shutdown_pauses_workers_that_outlive_cancel_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("never")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let store = DownloadStore::open(DownloadDatabase::in_memory().await.unwrap())
            .await
            .unwrap();
        let settings = Settings {
            app_files_dir: dir.path().join("files"),
            cancel_timeout_ms: 0,
            ..Settings::default()
        };
        let (event_tx, _) = broadcast::channel(256);
        let engine = DownloadEngine::new(store, settings, dir.path().join("temp"), event_tx).unwrap();

        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/big.iso", server.uri())).unwrap())
            .await
            .unwrap();
        let (shutdown, runner) = start(&engine);
        wait_for_status(&engine, id, DownloadStatus::Running).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(engine.active_count(), 0);
        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn offline_holds_admission_until_online() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        engine.set_connectivity(Connectivity::Offline);
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/f", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.is_idle());
        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Pending);

        engine.set_connectivity(Connectivity::Online);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Successful);
    }

    #[tokio::test]
    async fn going_offline_pauses_running_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let id = engine
            .enqueue(DownloadRequest::new(&format!("{}/f", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        wait_for_status(&engine, id, DownloadStatus::Running).await;

        engine.set_connectivity(Connectivity::Offline);
        wait_for_status(&engine, id, DownloadStatus::Paused).await;
        settle(&engine).await;

        shutdown.cancel();
        runner.await.unwrap();
        assert_eq!(engine.store().get(id).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn notifications_follow_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&server)
            .await;

        let engine = engine(dir.path()).await;
        let mut events = engine.subscribe();
        let quiet = engine
            .enqueue(
                DownloadRequest::new(&format!("{}/quiet", server.uri()))
                    .unwrap()
                    .with_notification_visibility(NotificationVisibility::Hidden),
            )
            .await
            .unwrap();
        let loud = engine
            .enqueue(DownloadRequest::new(&format!("{}/loud", server.uri())).unwrap())
            .await
            .unwrap();

        let (shutdown, runner) = start(&engine);
        settle(&engine).await;
        shutdown.cancel();
        runner.await.unwrap();

        let mut notified = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Notification { id, status, .. } = event {
                notified.push((id, status));
            }
        }
        assert_eq!(notified, vec![(loud, DownloadStatus::Successful)]);
        assert_ne!(quiet, loud);
    }
}
