//! dlq Core - download queue manager
//!
//! This crate provides the core of dlq: a persistent store of download
//! records, an engine that performs the transfers, and a JSON bridge that
//! exposes `enqueue`, `query` and `remove` to callers.

mod bridge;
mod engine;
mod error;
mod storage;
mod store;

pub use bridge::*;
pub use engine::*;
pub use error::*;
pub use storage::*;
pub use store::*;

use dlq_types::{CoreEvent, DownloadId, DownloadQuery, DownloadRecord, DownloadRequest, Settings};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The main dlq core instance
#[derive(Clone)]
pub struct DlqCore {
    /// Data directory layout and settings file
    pub storage: Storage,
    /// Settings the engine was started with
    settings: Settings,
    engine: DownloadEngine,
    bridge: Bridge,
}

impl DlqCore {
    /// Open the data directory, loading `settings.json` if present
    pub async fn new(data_dir: PathBuf) -> Result<Self, DlqError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        Self::with_settings(storage, settings).await
    }

    /// Open the data directory with explicit settings
    pub async fn with_settings(storage: Storage, settings: Settings) -> Result<Self, DlqError> {
        let temp_dir = storage.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;

        let db = DownloadDatabase::new(storage.database_path()).await?;
        let store = DownloadStore::open(db).await?;

        let (event_tx, _) = broadcast::channel(1000);
        let engine = DownloadEngine::new(store, settings.clone(), temp_dir, event_tx)?;
        let bridge = Bridge::new(engine.clone());

        info!("dlq core ready at {}", storage.data_dir().display());

        Ok(Self {
            storage,
            settings,
            engine,
            bridge,
        })
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.engine.subscribe()
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, DlqError> {
        self.engine.enqueue(request).await
    }

    pub fn query(&self, query: &DownloadQuery) -> Vec<DownloadRecord> {
        self.engine.query(query)
    }

    pub async fn remove(&self, ids: &[DownloadId]) -> Result<usize, DlqError> {
        self.engine.remove(ids).await
    }

    /// Raw bridge call, as made by a web-view host
    pub async fn execute(&self, action: &str, args: Value) -> Result<Value, BridgeError> {
        self.bridge.execute(action, args).await
    }

    /// Drive transfers until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        self.engine.run(shutdown).await
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Settings in effect for this instance
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Persist new settings. They take effect the next time the core is opened.
    pub async fn update_settings(&self, settings: &Settings) -> Result<(), DlqError> {
        self.storage.save_settings(settings).await
    }
}
