//! Download store - the authoritative table of download records
//!
//! Records live in an in-memory table guarded by a coarse read/write lock
//! and are mirrored to SQLite on every mutation. Writers of one record are
//! serialized by a per-record async lock held across the table update and
//! its database write. Queries only take the table read lock.

mod persistence;

pub use persistence::*;

use crate::error::DlqError;
use chrono::Utc;
use dlq_types::{DownloadId, DownloadQuery, DownloadRecord, DownloadRequest, DownloadStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Write handle held by an engine worker.
///
/// Writes through a lease are discarded once the record has been retired
/// or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: DownloadId,
    generation: u64,
}

/// A status change plus whatever fields come with it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub status: DownloadStatus,
    pub bytes_downloaded: Option<i64>,
    pub bytes_total: Option<i64>,
    pub local_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub media_type: Option<String>,
}

impl RecordUpdate {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status,
            bytes_downloaded: None,
            bytes_total: None,
            local_path: None,
            failure_reason: None,
            media_type: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::status(DownloadStatus::Failed)
        }
    }

    pub fn with_progress(mut self, downloaded: i64, total: i64) -> Self {
        self.bytes_downloaded = Some(downloaded);
        self.bytes_total = Some(total);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn with_media_type(mut self, media_type: Option<String>) -> Self {
        self.media_type = media_type;
        self
    }

    fn apply_to(self, record: &mut DownloadRecord) {
        record.status = self.status;
        if let Some(downloaded) = self.bytes_downloaded {
            record.bytes_downloaded = downloaded;
        }
        if let Some(total) = self.bytes_total {
            record.bytes_total = total;
        }
        if self.status == DownloadStatus::Successful {
            if let Some(path) = self.local_path {
                record.local_path = Some(path);
            }
        }
        record.failure_reason = if self.status == DownloadStatus::Failed {
            self.failure_reason.or_else(|| Some("Unknown error".to_string()))
        } else {
            None
        };
        if record.media_type.is_none() {
            record.media_type = self.media_type;
        }
        record.last_modified = Utc::now();
    }
}

struct Slot {
    record: DownloadRecord,
    generation: u64,
    /// Set once removal has started; hidden from queries from then on
    retired: bool,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new(record: DownloadRecord) -> Self {
        Self {
            record,
            generation: 0,
            retired: false,
            writer: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Shared, persistent table of download records
#[derive(Clone)]
pub struct DownloadStore {
    slots: Arc<RwLock<BTreeMap<DownloadId, Slot>>>,
    db: DownloadDatabase,
}

impl DownloadStore {
    /// Load every persisted record.
    ///
    /// Records left RUNNING by an interrupted process are demoted to PAUSED
    /// so the engine resumes them from their saved offset.
    pub async fn open(db: DownloadDatabase) -> Result<Self, DlqError> {
        let mut records = db.load_all_downloads().await?;
        let mut interrupted = 0;

        for record in records.iter_mut().filter(|r| r.status == DownloadStatus::Running) {
            record.status = DownloadStatus::Paused;
            record.last_modified = Utc::now();
            db.update_download(record).await?;
            interrupted += 1;
        }

        info!(
            "Loaded {} downloads from database ({} interrupted)",
            records.len(),
            interrupted
        );

        let slots = records
            .into_iter()
            .map(|record| (record.id, Slot::new(record)))
            .collect();

        Ok(Self {
            slots: Arc::new(RwLock::new(slots)),
            db,
        })
    }

    /// Validate a request and insert it as a PENDING record
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, DlqError> {
        request.validate()?;

        let mut record = DownloadRecord::new(0, request);
        record.id = self.db.insert_download(&record).await?;
        let id = record.id;

        info!("Enqueued download {}: {}", id, record.request.uri);
        self.slots.write().insert(id, Slot::new(record));

        Ok(id)
    }

    /// Snapshot of the records matching `query`, in id order
    pub fn query(&self, query: &DownloadQuery) -> Vec<DownloadRecord> {
        self.slots
            .read()
            .values()
            .filter(|slot| !slot.retired && query.matches(&slot.record))
            .map(|slot| slot.record.clone())
            .collect()
    }

    pub fn get(&self, id: DownloadId) -> Option<DownloadRecord> {
        self.slots
            .read()
            .get(&id)
            .filter(|slot| !slot.retired)
            .map(|slot| slot.record.clone())
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| !slot.retired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a write lease on a live record
    pub fn lease(&self, id: DownloadId) -> Result<Lease, DlqError> {
        self.slots
            .read()
            .get(&id)
            .filter(|slot| !slot.retired)
            .map(|slot| Lease {
                id,
                generation: slot.generation,
            })
            .ok_or(DlqError::NotFound(id))
    }

    /// Apply an engine update to a record by id
    pub async fn update_status(
        &self,
        id: DownloadId,
        update: RecordUpdate,
    ) -> Result<DownloadRecord, DlqError> {
        self.apply(id, None, update).await
    }

    /// Apply an update through a lease; stale leases get [`DlqError::StaleWrite`]
    pub async fn update_leased(
        &self,
        lease: &Lease,
        update: RecordUpdate,
    ) -> Result<DownloadRecord, DlqError> {
        self.apply(lease.id, Some(lease.generation), update).await
    }

    async fn apply(
        &self,
        id: DownloadId,
        generation: Option<u64>,
        update: RecordUpdate,
    ) -> Result<DownloadRecord, DlqError> {
        let missing = || match generation {
            Some(_) => DlqError::StaleWrite(id),
            None => DlqError::NotFound(id),
        };

        let writer = {
            let slots = self.slots.read();
            let slot = slots.get(&id).ok_or_else(missing)?;
            slot.writer.clone()
        };
        let _writing = writer.lock().await;

        let snapshot = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(&id).ok_or_else(missing)?;

            match generation {
                Some(generation) if generation != slot.generation => {
                    debug!("Discarding stale write for download {}", id);
                    return Err(DlqError::StaleWrite(id));
                }
                None if slot.retired => return Err(DlqError::NotFound(id)),
                _ => {}
            }

            let from = slot.record.status;
            if !from.can_transition_to(update.status) {
                return Err(DlqError::InvalidTransition {
                    id,
                    from,
                    to: update.status,
                });
            }

            let mut next = slot.record.clone();
            update.apply_to(&mut next);
            next
        };

        // Commit to the table only once the row is on disk
        self.db.update_download(&snapshot).await?;
        if let Some(slot) = self.slots.write().get_mut(&id) {
            slot.record = snapshot.clone();
        }
        Ok(snapshot)
    }

    /// Close the database; later writes fail
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Start removing a record: bump its generation so outstanding leases
    /// go stale, and hide it from queries. Returns false for unknown ids.
    pub fn retire(&self, id: DownloadId) -> bool {
        match self.slots.write().get_mut(&id) {
            Some(slot) => {
                slot.generation += 1;
                slot.retired = true;
                true
            }
            None => false,
        }
    }

    /// Delete records regardless of status; unknown ids are skipped.
    /// Returns the number of records deleted.
    pub async fn remove(&self, ids: &[DownloadId]) -> Result<usize, DlqError> {
        Ok(self.remove_records(ids).await?.len())
    }

    /// Like [`DownloadStore::remove`], returning the final state of each
    /// deleted record
    pub async fn remove_records(&self, ids: &[DownloadId]) -> Result<Vec<DownloadRecord>, DlqError> {
        let mut removed = Vec::new();

        for &id in ids {
            let writer = match self.slots.read().get(&id) {
                Some(slot) => slot.writer.clone(),
                None => continue,
            };

            // Wait for an in-flight write of this record to land first
            let _writing = writer.lock().await;

            if !self.slots.read().contains_key(&id) {
                continue;
            }
            self.db.delete_download(id).await?;

            let slot = match self.slots.write().remove(&id) {
                Some(slot) => slot,
                None => continue,
            };
            info!("Removed download {} ({})", id, slot.record.status);
            removed.push(slot.record);
        }

        Ok(removed)
    }
}
