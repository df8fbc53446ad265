//! SQLite-based persistence layer for download records
//!
//! One row per record. Ids come from `AUTOINCREMENT`, so an id is never
//! handed out twice, even after the row holding it has been deleted.

use crate::error::DlqError;
use chrono::{DateTime, Utc};
use dlq_types::{
    Destination, DownloadId, DownloadRecord, DownloadRequest, DownloadStatus,
    NotificationVisibility,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS downloads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL,
        title TEXT,
        description TEXT,
        mime_type TEXT,
        destination TEXT NOT NULL,
        visible_in_downloads_ui INTEGER NOT NULL DEFAULT 1,
        notification_visibility INTEGER NOT NULL DEFAULT 3,
        status TEXT NOT NULL,
        bytes_downloaded INTEGER NOT NULL DEFAULT 0,
        bytes_total INTEGER NOT NULL DEFAULT -1,
        local_path TEXT,
        failure_reason TEXT,
        media_type TEXT,
        created_at TEXT NOT NULL,
        last_modified TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
"#;

/// Database connection pool for record persistence
#[derive(Clone, Debug)]
pub struct DownloadDatabase {
    pool: SqlitePool,
}

impl DownloadDatabase {
    /// Open (or create) the database file and its schema
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DlqError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database, gone when the value is dropped
    pub async fn in_memory() -> Result<Self, DlqError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to `:memory:` is a separate database, so pin one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Close the pool, waiting for in-flight queries
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, DlqError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new record and return the id allocated for it.
    ///
    /// The `id` field of `record` is ignored.
    pub async fn insert_download(&self, record: &DownloadRecord) -> Result<DownloadId, DlqError> {
        let destination = serde_json::to_string(&record.request.destination)?;

        let result = sqlx::query(
            r#"
            INSERT INTO downloads (
                uri, title, description, mime_type, destination,
                visible_in_downloads_ui, notification_visibility, status,
                bytes_downloaded, bytes_total, local_path, failure_reason,
                media_type, created_at, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.request.uri.as_str())
        .bind(record.request.title.as_ref())
        .bind(record.request.description.as_ref())
        .bind(record.request.mime_type.as_ref())
        .bind(destination)
        .bind(record.request.visible_in_downloads_ui as i64)
        .bind(record.request.notification_visibility.code())
        .bind(record.status.as_str())
        .bind(record.bytes_downloaded)
        .bind(record.bytes_total)
        .bind(record.local_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(record.failure_reason.as_ref())
        .bind(record.media_type.as_ref())
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Write the mutable state of an existing record
    pub async fn update_download(&self, record: &DownloadRecord) -> Result<(), DlqError> {
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, bytes_downloaded = ?, bytes_total = ?, local_path = ?,
                failure_reason = ?, media_type = ?, last_modified = ?
            WHERE id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.bytes_downloaded)
        .bind(record.bytes_total)
        .bind(record.local_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(record.failure_reason.as_ref())
        .bind(record.media_type.as_ref())
        .bind(record.last_modified.to_rfc3339())
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load all records in id order
    pub async fn load_all_downloads(&self) -> Result<Vec<DownloadRecord>, DlqError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Delete a record; returns whether a row existed
    pub async fn delete_download(&self, id: DownloadId) -> Result<bool, DlqError> {
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Convert a database row to a DownloadRecord
fn row_to_record(row: SqliteRow) -> Result<DownloadRecord, DlqError> {
    let uri: String = row.get("uri");
    let status: String = row.get("status");
    let destination: String = row.get("destination");

    let request = DownloadRequest {
        uri: url::Url::parse(&uri).map_err(|e| DlqError::Unknown(e.to_string()))?,
        title: row.get("title"),
        description: row.get("description"),
        mime_type: row.get("mime_type"),
        destination: serde_json::from_str::<Destination>(&destination)?,
        visible_in_downloads_ui: row.get::<i64, _>("visible_in_downloads_ui") != 0,
        notification_visibility: NotificationVisibility::from_code(
            row.get::<i64, _>("notification_visibility"),
        )
        .unwrap_or_default(),
    };

    Ok(DownloadRecord {
        id: row.get("id"),
        request,
        status: DownloadStatus::from_str(&status)?,
        bytes_downloaded: row.get("bytes_downloaded"),
        bytes_total: row.get("bytes_total"),
        local_path: row.get::<Option<String>, _>("local_path").map(PathBuf::from),
        failure_reason: row.get("failure_reason"),
        media_type: row.get("media_type"),
        created_at: parse_timestamp(row.get("created_at"))?,
        last_modified: parse_timestamp(row.get("last_modified"))?,
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, DlqError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DlqError::Unknown(e.to_string()))
}
