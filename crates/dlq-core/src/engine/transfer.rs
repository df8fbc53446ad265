//! Transfer worker - moves the bytes of one download
//!
//! Bytes land in `{temp_dir}/{id}.part`. An interrupted transfer resumes from
//! the length of that file with an open-ended `Range` request; a server that
//! answers with the whole body instead restarts the file from zero. Finished
//! files are moved to their resolved destination.

use crate::engine::retry;
use crate::error::{DlqError, TransferError};
use crate::store::{DownloadStore, Lease, RecordUpdate};
use dlq_types::{CoreEvent, DownloadId, DownloadRecord, DownloadStatus, Settings};
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every worker of one engine
pub(crate) struct TransferContext {
    pub store: DownloadStore,
    pub client: Client,
    pub settings: Settings,
    pub temp_dir: PathBuf,
    pub event_tx: broadcast::Sender<CoreEvent>,
}

impl TransferContext {
    pub fn part_path(&self, id: DownloadId) -> PathBuf {
        self.temp_dir.join(format!("{}.part", id))
    }

    /// Broadcast a status change, plus a notification when the record's
    /// visibility asks for one
    pub fn announce(&self, record: &DownloadRecord) {
        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id: record.id,
            status: record.status,
            reason: record.failure_reason.clone(),
        });

        let visibility = record.request.notification_visibility;
        let notify = if record.status.is_terminal() {
            visibility.notifies_completion()
        } else {
            visibility.notifies_progress()
        };
        if notify {
            let _ = self.event_tx.send(CoreEvent::Notification {
                id: record.id,
                title: record.title(),
                status: record.status,
            });
        }
    }
}

/// A completely received body sitting in the part file
struct Fetched {
    bytes: i64,
    /// Name suggested by `Content-Disposition`
    file_name: Option<String>,
}

/// Worker for one admitted (RUNNING) record
pub(crate) struct Transfer {
    ctx: Arc<TransferContext>,
    record: DownloadRecord,
    lease: Lease,
    cancel: CancellationToken,
}

impl Transfer {
    pub fn new(
        ctx: Arc<TransferContext>,
        record: DownloadRecord,
        lease: Lease,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            record,
            lease,
            cancel,
        }
    }

    /// Drive the record to SUCCESSFUL, FAILED or (when cancelled) PAUSED
    pub async fn run(self) {
        let id = self.record.id;
        info!("Starting transfer {}: {}", id, self.record.request.uri);

        if let Err(e) = self.record.request.destination.validate() {
            return self.fail(e.into()).await;
        }

        let result =
            retry::with_retry(&self.ctx.settings.retry, id, &self.cancel, || self.fetch()).await;

        match result {
            Ok(Some(fetched)) => self.finish(fetched).await,
            Ok(None) => self.interrupt().await,
            Err(_) if self.cancel.is_cancelled() => self.interrupt().await,
            Err(e) => self.fail(e).await,
        }
    }

    /// One attempt at receiving the body. `Ok(None)` means the transfer was
    /// cancelled or its record is gone.
    async fn fetch(&self) -> Result<Option<Fetched>, TransferError> {
        let id = self.record.id;
        let part = self.ctx.part_path(id);
        fs::create_dir_all(&self.ctx.temp_dir).await?;

        let offset = fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.ctx.client.get(self.record.request.uri.clone());
        if offset > 0 {
            debug!("Resuming download {} from byte {}", id, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let read_timeout = Duration::from_secs(self.ctx.settings.read_timeout_secs);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            sent = tokio::time::timeout(read_timeout, request.send()) => match sent {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransferError::Transient(
                        "Timed out waiting for response".to_string(),
                    ))
                }
            },
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            warn!("Server rejected resume of download {} at byte {}, restarting", id, offset);
            fs::remove_file(&part).await?;
            return Err(TransferError::Transient(format!("Server error: {}", status)));
        }
        if !status.is_success() {
            return Err(TransferError::from_status(status));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let offset = if resumed {
            offset as i64
        } else {
            if offset > 0 {
                info!("Server ignored range for download {}, restarting from zero", id);
            }
            0
        };

        let headers = response.headers();
        let length = header_i64(headers, CONTENT_LENGTH.as_str());
        let total = if resumed {
            content_range_total(headers).or(length.map(|l| l + offset))
        } else {
            length
        }
        .unwrap_or(DownloadRecord::UNKNOWN_SIZE);
        let media_type = media_type(headers);
        let file_name = content_disposition_name(headers);

        let mut downloaded = offset;
        let started = RecordUpdate::status(DownloadStatus::Running)
            .with_progress(downloaded, total)
            .with_media_type(media_type);
        if !self.write_progress(started).await? {
            return Ok(None);
        }

        let mut file = if resumed {
            OpenOptions::new().create(true).append(true).open(&part).await?
        } else {
            fs::File::create(&part).await?
        };

        let interval = Duration::from_millis(self.ctx.settings.progress_interval_ms);
        let mut last_progress = Instant::now();
        let mut stream = response.bytes_stream();

        // true once the body ended, false when interrupted
        let outcome: Result<bool, TransferError> = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(false),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    break Err(TransferError::Transient(format!(
                        "No data received for {}s",
                        read_timeout.as_secs()
                    )))
                }
                Ok(None) => break Ok(true),
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(Some(Ok(chunk))) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        break Err(e.into());
                    }
                    downloaded += chunk.len() as i64;

                    if last_progress.elapsed() >= interval {
                        last_progress = Instant::now();
                        let update = RecordUpdate::status(DownloadStatus::Running)
                            .with_progress(downloaded, total);
                        match self.write_progress(update).await {
                            Ok(true) => {}
                            Ok(false) => break Ok(false),
                            Err(e) => break Err(e),
                        }
                    }
                }
            }
        };

        // The next attempt resumes from the file length, so it must be settled
        file.flush().await?;
        if !outcome? {
            return Ok(None);
        }
        file.sync_all().await?;

        if total >= 0 && downloaded < total {
            return Err(TransferError::Transient(format!(
                "Connection closed after {} of {} bytes",
                downloaded, total
            )));
        }
        if total >= 0 && downloaded > total {
            fs::remove_file(&part).await?;
            return Err(TransferError::Permanent(format!(
                "Received {} bytes, expected {}",
                downloaded, total
            )));
        }

        Ok(Some(Fetched {
            bytes: downloaded,
            file_name,
        }))
    }

    /// Persist progress through the lease. `Ok(false)` when the record was
    /// retired under us.
    async fn write_progress(&self, update: RecordUpdate) -> Result<bool, TransferError> {
        match self.ctx.store.update_leased(&self.lease, update).await {
            Ok(record) => {
                let _ = self.ctx.event_tx.send(CoreEvent::DownloadProgress {
                    id: record.id,
                    downloaded: record.bytes_downloaded,
                    total: record.bytes_total,
                });
                Ok(true)
            }
            Err(DlqError::StaleWrite(_)) => Ok(false),
            Err(e) => Err(TransferError::Permanent(e.to_string())),
        }
    }

    async fn finish(&self, fetched: Fetched) {
        let id = self.record.id;
        let fallback = fetched
            .file_name
            .or_else(|| self.record.request.file_name())
            .unwrap_or_else(|| format!("download-{}", id));

        let target = match self
            .record
            .request
            .destination
            .resolve(&self.ctx.settings, &fallback)
        {
            Ok(target) => target,
            Err(e) => return self.fail(e.into()).await,
        };

        let path = match place_file(&self.ctx.part_path(id), &target).await {
            Ok(path) => path,
            Err(e) => return self.fail(e).await,
        };

        let update = RecordUpdate::status(DownloadStatus::Successful)
            .with_progress(fetched.bytes, fetched.bytes)
            .with_path(path.clone())
            .with_media_type(media_type_for_extension(&path));
        match self.ctx.store.update_leased(&self.lease, update).await {
            Ok(record) => {
                info!("Download {} completed: {}", id, path.display());
                self.ctx.announce(&record);
            }
            Err(DlqError::StaleWrite(_)) => {
                debug!("Download {} removed while finishing, discarding file", id);
                let _ = fs::remove_file(&path).await;
            }
            Err(e) => warn!("Failed to record completion of download {}: {}", id, e),
        }
    }

    async fn fail(&self, error: TransferError) {
        let id = self.record.id;
        let reason = error.to_string();
        error!("Download {} failed: {}", id, reason);

        let _ = fs::remove_file(self.ctx.part_path(id)).await;
        match self
            .ctx
            .store
            .update_leased(&self.lease, RecordUpdate::failed(reason))
            .await
        {
            Ok(record) => self.ctx.announce(&record),
            Err(DlqError::StaleWrite(_)) => {}
            Err(e) => warn!("Failed to record failure of download {}: {}", id, e),
        }
    }

    async fn interrupt(&self) {
        let id = self.record.id;
        let part = self.ctx.part_path(id);
        let bytes = fs::metadata(&part).await.map(|m| m.len() as i64).unwrap_or(0);

        let mut update = RecordUpdate::status(DownloadStatus::Paused);
        update.bytes_downloaded = Some(bytes);

        match self.ctx.store.update_leased(&self.lease, update).await {
            Ok(record) => {
                info!("Download {} paused at byte {}", id, bytes);
                self.ctx.announce(&record);
            }
            Err(DlqError::StaleWrite(_)) => {
                debug!("Download {} removed, discarding partial file", id);
                let _ = fs::remove_file(&part).await;
            }
            Err(e) => warn!("Failed to record pause of download {}: {}", id, e),
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total size from `Content-Range: bytes 100-199/200`
fn content_range_total(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.trim().parse().ok())
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Media type guessed from the file extension, for servers that send none
fn media_type_for_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();

    let media_type = match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "apk" => "application/vnd.android.package-archive",
        "iso" => "application/x-iso9660-image",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };
    Some(media_type.to_string())
}

/// File name from `Content-Disposition`, stripped of any directories
fn content_disposition_name(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split("filename=").nth(1))
        .map(|v| v.split(';').next().unwrap_or(v).trim().trim_matches('"'))
        .and_then(|v| Path::new(v).file_name())
        .map(|v| v.to_string_lossy().into_owned())
        .filter(|v| !v.is_empty())
}

/// Move the part file to `target`, or to `name-N.ext` next to it when
/// `target` is taken. Never replaces an existing file.
async fn place_file(part: &Path, target: &Path) -> Result<PathBuf, TransferError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let path = claim_path(target).await?;
    if let Err(e) = move_onto_claim(part, &path).await {
        let _ = fs::remove_file(&path).await;
        return Err(e.into());
    }
    Ok(path)
}

async fn move_onto_claim(part: &Path, claimed: &Path) -> std::io::Result<()> {
    if fs::rename(part, claimed).await.is_err() {
        // Different filesystems
        fs::copy(part, claimed).await?;
        fs::remove_file(part).await?;
    }
    Ok(())
}

/// Reserve `target`, or the first free `name-N.ext`, by creating it empty.
/// Creation fails on an existing file, so concurrent callers never share
/// a name.
async fn claim_path(target: &Path) -> std::io::Result<PathBuf> {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = target.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 0;
    loop {
        let candidate = if n == 0 {
            target.to_path_buf()
        } else {
            let name = match &extension {
                Some(ext) => format!("{}-{}.{}", stem, n, ext),
                None => format!("{}-{}", stem, n),
            };
            target.with_file_name(name)
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn parses_content_range_total() {
        assert_eq!(
            content_range_total(&headers(&[("content-range", "bytes 100-199/200")])),
            Some(200)
        );
        assert_eq!(
            content_range_total(&headers(&[("content-range", "bytes 100-199/*")])),
            None
        );
        assert_eq!(content_range_total(&HeaderMap::new()), None);
    }

    #[test]
    fn media_type_drops_parameters() {
        assert_eq!(
            media_type(&headers(&[("content-type", "text/plain; charset=utf-8")])).as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn media_type_falls_back_to_extension() {
        assert_eq!(
            media_type_for_extension(Path::new("/tmp/report.PDF")).as_deref(),
            Some("application/pdf")
        );
        assert_eq!(media_type_for_extension(Path::new("/tmp/blob.xyz")), None);
        assert_eq!(media_type_for_extension(Path::new("/tmp/noext")), None);
    }

    #[test]
    fn disposition_name_cannot_escape() {
        assert_eq!(
            content_disposition_name(&headers(&[(
                "content-disposition",
                "attachment; filename=\"../../evil.sh\""
            )]))
            .as_deref(),
            Some("evil.sh")
        );
        assert_eq!(
            content_disposition_name(&headers(&[("content-disposition", "inline")])),
            None
        );
    }

    #[tokio::test]
    async fn taken_targets_get_a_numbered_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");

        assert_eq!(claim_path(&target).await.unwrap(), target);
        fs::write(dir.path().join("file-1.bin"), b"b").await.unwrap();
        assert_eq!(
            claim_path(&target).await.unwrap(),
            dir.path().join("file-2.bin")
        );
        assert_eq!(fs::read(dir.path().join("file-1.bin")).await.unwrap(), b"b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_placements_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/file.bin");

        for round in 0..50 {
            let mut handles = Vec::new();
            for worker in 0..4u8 {
                let part = dir.path().join(format!("{}-{}.part", round, worker));
                fs::write(&part, vec![worker; 4]).await.unwrap();
                let target = target.clone();
                handles.push(tokio::spawn(async move {
                    (worker, place_file(&part, &target).await.unwrap())
                }));
            }

            let mut placed = Vec::new();
            for handle in handles {
                let (worker, path) = handle.await.unwrap();
                assert_eq!(fs::read(&path).await.unwrap(), vec![worker; 4]);
                placed.push(path);
            }
            placed.sort();
            placed.dedup();
            assert_eq!(placed.len(), 4, "round {} reused a file", round);

            fs::remove_dir_all(dir.path().join("out")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn place_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("7.part");
        fs::write(&part, b"payload").await.unwrap();

        let target = dir.path().join("nested/dir/out.txt");
        let placed = place_file(&part, &target).await.unwrap();

        assert_eq!(placed, target);
        assert_eq!(fs::read(&target).await.unwrap(), b"payload");
        assert!(!fs::try_exists(&part).await.unwrap());
    }
}
