//! Error types for dlq core

use dlq_types::{DownloadId, DownloadStatus, RequestError, SettingsError};
use thiserror::Error;

/// Errors that can occur in dlq core
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Download not found: {0}")]
    NotFound(DownloadId),

    #[error("Invalid transition for download {id}: {from} -> {to}")]
    InvalidTransition {
        id: DownloadId,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("Stale write for download {0} discarded")]
    StaleWrite(DownloadId),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for DlqError {
    fn from(error: serde_json::Error) -> Self {
        DlqError::Serialization(error.to_string())
    }
}

/// Failure while moving bytes for one download
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Worth another attempt after a backoff delay
    #[error("{0}")]
    Transient(String),

    /// Fails the download immediately
    #[error("{0}")]
    Permanent(String),
}

impl TransferError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }

    /// Classify an HTTP status that is not a success
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        let message = format!("Server error: {}", status);
        match status.as_u16() {
            408 | 429 => TransferError::Transient(message),
            500..=599 => TransferError::Transient(message),
            _ => TransferError::Permanent(message),
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return TransferError::from_status(status);
        }
        if error.is_timeout() || error.is_connect() || error.is_body() || error.is_request() {
            TransferError::Transient(format!("Network error: {}", error))
        } else {
            TransferError::Permanent(format!("Network error: {}", error))
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let message = format!("IO error: {}", error);
        match error.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof => TransferError::Transient(message),
            _ => TransferError::Permanent(message),
        }
    }
}

impl From<RequestError> for TransferError {
    fn from(error: RequestError) -> Self {
        TransferError::Permanent(error.to_string())
    }
}
