//! Shared types for dlq
//!
//! This crate contains the data structures shared by the core library
//! and the CLI: download requests, records, query filters, the fixed
//! row schema returned over the bridge, settings and core events.

mod payload;

pub use payload::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Identifier of a download record. Allocated monotonically, never reused.
pub type DownloadId = i64;

// ============================================================================
// Errors
// ============================================================================

/// Validation failures for incoming requests, queries and id lists
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported uri scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("ambiguous destination: {0} are mutually exclusive")]
    AmbiguousDestination(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("invalid download id `{0}`")]
    InvalidId(String),

    #[error("invalid notification visibility: {0}")]
    InvalidVisibility(i64),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Settings values the engine cannot run with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid setting `{key}`: {reason}")]
pub struct SettingsError {
    pub key: &'static str,
    pub reason: String,
}

impl SettingsError {
    fn new(key: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Status of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 5] = [
        DownloadStatus::Pending,
        DownloadStatus::Running,
        DownloadStatus::Paused,
        DownloadStatus::Successful,
        DownloadStatus::Failed,
    ];

    /// Wire code, matching the platform download manager's status constants
    pub fn code(self) -> i64 {
        match self {
            DownloadStatus::Pending => 1,
            DownloadStatus::Running => 2,
            DownloadStatus::Paused => 4,
            DownloadStatus::Successful => 8,
            DownloadStatus::Failed => 16,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// SUCCESSFUL and FAILED never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Successful | DownloadStatus::Failed)
    }

    /// Whether the engine may move a record from `self` to `next`.
    ///
    /// Same-state updates are allowed for non-terminal states so progress
    /// can be written without a status change.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        if self == next {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Successful)
                | (Running, Failed)
                | (Paused, Running)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::Running => "RUNNING",
            DownloadStatus::Paused => "PAUSED",
            DownloadStatus::Successful => "SUCCESSFUL",
            DownloadStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RequestError::Malformed(format!("unknown status `{}`", s)))
    }
}

/// A set of statuses used to filter queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusFilter(BTreeSet<DownloadStatus>);

impl StatusFilter {
    /// Every known status
    pub fn all() -> Self {
        Self(DownloadStatus::ALL.into_iter().collect())
    }

    /// PENDING, RUNNING and PAUSED
    pub fn active() -> Self {
        [
            DownloadStatus::Pending,
            DownloadStatus::Running,
            DownloadStatus::Paused,
        ]
        .into_iter()
        .collect()
    }

    /// Build a filter from a wire bitmask. Unknown bits are ignored.
    pub fn from_mask(mask: i64) -> Self {
        DownloadStatus::ALL
            .into_iter()
            .filter(|status| mask & status.code() != 0)
            .collect()
    }

    pub fn to_mask(&self) -> i64 {
        self.0.iter().fold(0, |mask, status| mask | status.code())
    }

    pub fn contains(&self, status: DownloadStatus) -> bool {
        self.0.contains(&status)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DownloadStatus> + '_ {
        self.0.iter().copied()
    }
}

impl Default for StatusFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<DownloadStatus> for StatusFilter {
    fn from_iter<I: IntoIterator<Item = DownloadStatus>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// When the host should surface a notification for a download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationVisibility {
    /// Shown while the transfer runs, dismissed on completion
    Visible,
    /// Shown while running and after completion
    VisibleNotifyCompleted,
    Hidden,
    /// Shown only once the transfer has finished
    #[default]
    VisibleNotifyOnlyCompletion,
}

impl NotificationVisibility {
    pub fn code(self) -> i64 {
        match self {
            NotificationVisibility::Visible => 0,
            NotificationVisibility::VisibleNotifyCompleted => 1,
            NotificationVisibility::Hidden => 2,
            NotificationVisibility::VisibleNotifyOnlyCompletion => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, RequestError> {
        match code {
            0 => Ok(NotificationVisibility::Visible),
            1 => Ok(NotificationVisibility::VisibleNotifyCompleted),
            2 => Ok(NotificationVisibility::Hidden),
            3 => Ok(NotificationVisibility::VisibleNotifyOnlyCompletion),
            other => Err(RequestError::InvalidVisibility(other)),
        }
    }

    pub fn notifies_progress(self) -> bool {
        matches!(
            self,
            NotificationVisibility::Visible | NotificationVisibility::VisibleNotifyCompleted
        )
    }

    pub fn notifies_completion(self) -> bool {
        matches!(
            self,
            NotificationVisibility::VisibleNotifyCompleted
                | NotificationVisibility::VisibleNotifyOnlyCompletion
        )
    }
}

/// Where a finished download is placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Under the application's private files directory
    AppPrivate {
        dir_type: Option<String>,
        sub_path: Option<String>,
    },
    /// Under the shared, user-visible downloads directory
    SharedPublic {
        dir_type: Option<String>,
        sub_path: Option<String>,
    },
    /// An explicit `file:` URI
    Uri { uri: Url },
}

impl Default for Destination {
    fn default() -> Self {
        Destination::AppPrivate {
            dir_type: None,
            sub_path: None,
        }
    }
}

impl Destination {
    pub fn validate(&self) -> Result<(), RequestError> {
        match self {
            Destination::AppPrivate { dir_type, sub_path }
            | Destination::SharedPublic { dir_type, sub_path } => {
                for part in [dir_type, sub_path].into_iter().flatten() {
                    check_relative(part)?;
                }
                Ok(())
            }
            Destination::Uri { uri } => {
                if uri.scheme() != "file" {
                    return Err(RequestError::InvalidDestination(format!(
                        "destination uri must use the file scheme, got `{}`",
                        uri.scheme()
                    )));
                }
                uri.to_file_path().map(|_| ()).map_err(|_| {
                    RequestError::InvalidDestination(format!("`{}` is not a local path", uri))
                })
            }
        }
    }

    /// Resolve the target file path for a download.
    ///
    /// A missing `sub_path` falls back to `fallback_name`.
    pub fn resolve(&self, settings: &Settings, fallback_name: &str) -> Result<PathBuf, RequestError> {
        self.validate()?;

        let (root, dir_type, sub_path) = match self {
            Destination::AppPrivate { dir_type, sub_path } => {
                (&settings.app_files_dir, dir_type, sub_path)
            }
            Destination::SharedPublic { dir_type, sub_path } => {
                (&settings.public_dir, dir_type, sub_path)
            }
            Destination::Uri { uri } => {
                return uri.to_file_path().map_err(|_| {
                    RequestError::InvalidDestination(format!("`{}` is not a local path", uri))
                });
            }
        };

        let mut path = root.clone();
        if let Some(dir_type) = dir_type {
            path.push(dir_type);
        }
        match sub_path {
            Some(sub_path) => path.push(sub_path),
            None => path.push(fallback_name),
        }
        Ok(path)
    }
}

fn check_relative(part: &str) -> Result<(), RequestError> {
    let path = Path::new(part);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(RequestError::InvalidDestination(format!(
            "`{}` must be a relative path without `..`",
            part
        )));
    }
    Ok(())
}

/// A validated download request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub uri: Url,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub destination: Destination,
    pub visible_in_downloads_ui: bool,
    #[serde(default)]
    pub notification_visibility: NotificationVisibility,
}

impl DownloadRequest {
    /// Parse and validate a source URI into a request with default settings
    pub fn new(uri: &str) -> Result<Self, RequestError> {
        let request = Self {
            uri: parse_source_uri(uri)?,
            title: None,
            description: None,
            mime_type: None,
            destination: Destination::default(),
            visible_in_downloads_ui: true,
            notification_visibility: NotificationVisibility::default(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_notification_visibility(mut self, visibility: NotificationVisibility) -> Self {
        self.notification_visibility = visibility;
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        match self.uri.scheme() {
            "http" | "https" => {}
            other => return Err(RequestError::UnsupportedScheme(other.to_string())),
        }
        if self.uri.host_str().map_or(true, str::is_empty) {
            return Err(RequestError::InvalidUri {
                uri: self.uri.to_string(),
                reason: "missing host".to_string(),
            });
        }
        self.destination.validate()
    }

    /// Last non-empty path segment of the source URI, percent-decoded
    pub fn file_name(&self) -> Option<String> {
        let segment = self
            .uri
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())?;
        let decoded = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());

        // A decoded `%2F` must not introduce directories
        Path::new(&decoded)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
    }
}

pub(crate) fn parse_source_uri(raw: &str) -> Result<Url, RequestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RequestError::MissingField("uri"));
    }
    Url::parse(trimmed).map_err(|e| RequestError::InvalidUri {
        uri: raw.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Record Types
// ============================================================================

/// The persisted state of one download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub request: DownloadRequest,
    pub status: DownloadStatus,
    pub bytes_downloaded: i64,
    /// Total size in bytes, or [`DownloadRecord::UNKNOWN_SIZE`]
    pub bytes_total: i64,
    pub local_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub media_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl DownloadRecord {
    pub const UNKNOWN_SIZE: i64 = -1;

    pub fn new(id: DownloadId, request: DownloadRequest) -> Self {
        let now = Utc::now();
        let media_type = request.mime_type.clone();
        Self {
            id,
            request,
            status: DownloadStatus::Pending,
            bytes_downloaded: 0,
            bytes_total: Self::UNKNOWN_SIZE,
            local_path: None,
            failure_reason: None,
            media_type,
            created_at: now,
            last_modified: now,
        }
    }

    /// Display title: the requested title, else the file name
    pub fn title(&self) -> String {
        self.request
            .title
            .clone()
            .or_else(|| self.request.file_name())
            .unwrap_or_else(|| format!("download-{}", self.id))
    }

    pub fn progress(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_downloaded as f64 / self.bytes_total as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn to_row(&self) -> DownloadRow {
        DownloadRow::from(self)
    }
}

/// Fixed row schema returned by `query` over the bridge.
///
/// Values are strings, absent values are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRow {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub description: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub total_size: String,
    pub bytes_so_far: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_filename: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub last_modified_timestamp: String,
    pub visible_in_downloads_ui: String,
    pub notification_visibility: String,
}

impl From<&DownloadRecord> for DownloadRow {
    fn from(record: &DownloadRecord) -> Self {
        Self {
            id: record.id.to_string(),
            title: record.title(),
            description: record.request.description.clone().unwrap_or_default(),
            uri: record.request.uri.to_string(),
            media_type: record.media_type.clone(),
            total_size: record.bytes_total.to_string(),
            bytes_so_far: record.bytes_downloaded.to_string(),
            local_uri: record
                .local_path
                .as_ref()
                .and_then(|p| Url::from_file_path(p).ok())
                .map(|u| u.to_string()),
            local_filename: record
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            status: record.status.code().to_string(),
            reason: record.failure_reason.clone(),
            last_modified_timestamp: record.last_modified.timestamp_millis().to_string(),
            visible_in_downloads_ui: record.request.visible_in_downloads_ui.to_string(),
            notification_visibility: record.request.notification_visibility.code().to_string(),
        }
    }
}

// ============================================================================
// Query Types
// ============================================================================

/// Filter for listing downloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadQuery {
    /// Empty means every id
    pub ids: Vec<DownloadId>,
    pub statuses: StatusFilter,
}

impl DownloadQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_ids(ids: impl IntoIterator<Item = DownloadId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            statuses: StatusFilter::all(),
        }
    }

    pub fn with_statuses(mut self, statuses: StatusFilter) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn matches(&self, record: &DownloadRecord) -> bool {
        (self.ids.is_empty() || self.ids.contains(&record.id))
            && self.statuses.contains(record.status)
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for app-private destinations
    pub app_files_dir: PathBuf,
    /// Root for shared public destinations
    pub public_dir: PathBuf,
    /// Transfer slots; excess records wait as PENDING
    pub max_concurrent_downloads: u32,
    pub retry: RetryConfig,
    pub connect_timeout_secs: u64,
    /// Maximum silence between two received chunks
    pub read_timeout_secs: u64,
    /// How long `remove` waits for a running worker to stop
    pub cancel_timeout_ms: u64,
    /// Minimum interval between persisted progress updates
    pub progress_interval_ms: u64,
    pub user_agent: String,
    /// Filter applied when a query carries no status mask
    pub default_status_filter: StatusFilter,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_files_dir: dirs::data_dir()
                .map(|p| p.join("dlq").join("files"))
                .unwrap_or_else(|| PathBuf::from(".dlq/files")),
            public_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from("Downloads")),
            max_concurrent_downloads: 4,
            retry: RetryConfig::default(),
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            cancel_timeout_ms: 5_000,
            progress_interval_ms: 500,
            user_agent: concat!("dlq/", env!("CARGO_PKG_VERSION")).to_string(),
            default_status_filter: StatusFilter::all(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_concurrent_downloads == 0 {
            return Err(SettingsError::new(
                "max_concurrent_downloads",
                "must be at least 1",
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(SettingsError::new("read_timeout_secs", "must be at least 1"));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for transient transfer failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SettingsError::new(
                "retry.backoff_multiplier",
                format!("must be a finite number >= 1, got {}", self.backoff_multiplier),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(SettingsError::new(
                "retry.initial_delay_ms",
                format!("must not exceed retry.max_delay_ms ({})", self.max_delay_ms),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadAdded {
        id: DownloadId,
    },
    DownloadStatusChanged {
        id: DownloadId,
        status: DownloadStatus,
        reason: Option<String>,
    },
    DownloadProgress {
        id: DownloadId,
        downloaded: i64,
        total: i64,
    },
    DownloadRemoved {
        id: DownloadId,
    },
    /// Emitted according to the record's notification visibility
    Notification {
        id: DownloadId,
        title: String,
        status: DownloadStatus,
    },
    ConnectivityChanged {
        online: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_wire_constants() {
        let codes: Vec<i64> = DownloadStatus::ALL.iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![1, 2, 4, 8, 16]);
        assert_eq!(DownloadStatus::from_code(8), Some(DownloadStatus::Successful));
        assert_eq!(DownloadStatus::from_code(3), None);
    }

    #[test]
    fn settings_reject_unusable_backoff() {
        assert_eq!(Settings::default().validate(), Ok(()));

        let mut settings = Settings::default();
        settings.retry.backoff_multiplier = -1.0;
        assert_eq!(
            settings.validate().unwrap_err().key,
            "retry.backoff_multiplier"
        );

        settings.retry.backoff_multiplier = f64::NAN;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.retry.initial_delay_ms = settings.retry.max_delay_ms + 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.max_concurrent_downloads = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn file_name_is_decoded_and_flat() {
        let request = DownloadRequest::new("https://x/dir/my%20file.bin").unwrap();
        assert_eq!(request.file_name().as_deref(), Some("my file.bin"));

        let request = DownloadRequest::new("https://x/a/..%2F..%2Fetc%2Fpasswd").unwrap();
        assert_eq!(request.file_name().as_deref(), Some("passwd"));

        let request = DownloadRequest::new("https://x/").unwrap();
        assert_eq!(request.file_name(), None);
    }

    #[test]
    fn terminal_states_never_transition() {
        for next in DownloadStatus::ALL {
            assert!(!DownloadStatus::Successful.can_transition_to(next));
            assert!(!DownloadStatus::Failed.can_transition_to(next));
        }
        assert!(DownloadStatus::Pending.can_transition_to(DownloadStatus::Running));
        assert!(DownloadStatus::Paused.can_transition_to(DownloadStatus::Running));
        assert!(!DownloadStatus::Paused.can_transition_to(DownloadStatus::Pending));
        assert!(!DownloadStatus::Pending.can_transition_to(DownloadStatus::Successful));
    }

    #[test]
    fn status_filter_from_mask() {
        let filter = StatusFilter::from_mask(1 | 16);
        assert!(filter.contains(DownloadStatus::Pending));
        assert!(filter.contains(DownloadStatus::Failed));
        assert!(!filter.contains(DownloadStatus::Running));
        assert_eq!(filter.to_mask(), 17);

        assert_eq!(StatusFilter::from_mask(31), StatusFilter::all());
        assert!(StatusFilter::from_mask(32).is_empty());
    }

    #[test]
    fn request_rejects_bad_uris() {
        assert!(matches!(
            DownloadRequest::new("not a uri"),
            Err(RequestError::InvalidUri { .. })
        ));
        assert!(matches!(
            DownloadRequest::new("ftp://example.com/a"),
            Err(RequestError::UnsupportedScheme(_))
        ));
        assert_eq!(DownloadRequest::new("  "), Err(RequestError::MissingField("uri")));
        assert!(DownloadRequest::new("https://x/file.bin").is_ok());
    }

    #[test]
    fn destination_rejects_escaping_sub_path() {
        let dest = Destination::SharedPublic {
            dir_type: Some("Downloads".into()),
            sub_path: Some("../etc/passwd".into()),
        };
        assert!(matches!(dest.validate(), Err(RequestError::InvalidDestination(_))));

        let dest = Destination::Uri {
            uri: Url::parse("https://example.com/x").unwrap(),
        };
        assert!(dest.validate().is_err());
    }

    #[test]
    fn destination_resolves_under_roots() {
        let settings = Settings {
            app_files_dir: PathBuf::from("/data/files"),
            public_dir: PathBuf::from("/sdcard/Download"),
            ..Settings::default()
        };

        let app = Destination::AppPrivate {
            dir_type: Some("Downloads".into()),
            sub_path: None,
        };
        assert_eq!(
            app.resolve(&settings, "file.bin").unwrap(),
            PathBuf::from("/data/files/Downloads/file.bin")
        );

        let public = Destination::SharedPublic {
            dir_type: None,
            sub_path: Some("music/song.mp3".into()),
        };
        assert_eq!(
            public.resolve(&settings, "ignored").unwrap(),
            PathBuf::from("/sdcard/Download/music/song.mp3")
        );
    }

    #[test]
    fn row_omits_absent_columns() {
        let request = DownloadRequest::new("https://x/file.bin").unwrap();
        let record = DownloadRecord::new(7, request);
        let value = serde_json::to_value(record.to_row()).unwrap();

        assert_eq!(value["_id"], "7");
        assert_eq!(value["title"], "file.bin");
        assert_eq!(value["status"], "1");
        assert_eq!(value["total_size"], "-1");
        assert!(value.get("local_uri").is_none());
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn notification_visibility_default_is_completion_only() {
        let visibility = NotificationVisibility::default();
        assert_eq!(visibility.code(), 3);
        assert!(visibility.notifies_completion());
        assert!(!visibility.notifies_progress());
    }
}
