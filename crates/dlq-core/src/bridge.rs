//! JSON bridge - the `execute(action, args)` facade over the engine
//!
//! Mirrors the web-view plugin contract:
//! - `enqueue` reads a request object from `args[0]` and returns the new id as a string
//! - `query` reads a filter object from `args[0]` and returns an array of rows
//! - `remove` reads `args` itself as a list of ids and returns the removed count
//!
//! The bridge only validates and translates; all state lives in the store.

use crate::engine::DownloadEngine;
use crate::error::DlqError;
use dlq_types::{
    parse_ids, DownloadId, DownloadRequest, DownloadRow, IdValue, QueryPayload, RequestError,
    RequestPayload,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Errors returned to bridge callers
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Download not found: {0}")]
    NotFound(DownloadId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidAction(_) => "invalid_action",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// `{ "status": kind, "message": text }` as handed to the error callback
    pub fn to_payload(&self) -> Value {
        json!({
            "status": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl From<DlqError> for BridgeError {
    fn from(error: DlqError) -> Self {
        match error {
            DlqError::InvalidRequest(e) => BridgeError::InvalidRequest(e),
            DlqError::NotFound(id) => BridgeError::NotFound(id),
            other => BridgeError::Internal(other.to_string()),
        }
    }
}

/// Actions understood by [`Bridge::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enqueue,
    Query,
    Remove,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Enqueue => "enqueue",
            Action::Query => "query",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue" => Ok(Action::Enqueue),
            "query" => Ok(Action::Query),
            "remove" => Ok(Action::Remove),
            other => Err(BridgeError::InvalidAction(other.to_string())),
        }
    }
}

/// Facade translating wire payloads into engine calls
#[derive(Clone)]
pub struct Bridge {
    engine: DownloadEngine,
}

impl Bridge {
    pub fn new(engine: DownloadEngine) -> Self {
        Self { engine }
    }

    /// Dispatch one call
    pub async fn execute(&self, action: &str, args: Value) -> Result<Value, BridgeError> {
        let action: Action = action.parse()?;
        debug!("Bridge call {} with {}", action, args);

        match action {
            Action::Enqueue => {
                let payload: RequestPayload = first_arg(&args)?;
                let id = self.enqueue(payload).await?;
                Ok(Value::String(id.to_string()))
            }
            Action::Query => {
                let payload: QueryPayload = first_arg(&args)?;
                let rows = self.query(payload)?;
                serde_json::to_value(rows).map_err(|e| BridgeError::Internal(e.to_string()))
            }
            Action::Remove => {
                let ids: Vec<IdValue> = serde_json::from_value(args).map_err(|e| {
                    RequestError::Malformed(format!("expected a list of ids: {}", e))
                })?;
                let removed = self.remove(&ids).await?;
                Ok(json!(removed))
            }
        }
    }

    pub async fn enqueue(&self, payload: RequestPayload) -> Result<DownloadId, BridgeError> {
        let request = DownloadRequest::try_from(payload)?;
        Ok(self.engine.enqueue(request).await?)
    }

    /// Rows matching the filter; a missing status mask uses the configured default
    pub fn query(&self, payload: QueryPayload) -> Result<Vec<DownloadRow>, BridgeError> {
        let query = payload.into_query(&self.engine.settings().default_status_filter)?;
        Ok(self
            .engine
            .query(&query)
            .iter()
            .map(DownloadRow::from)
            .collect())
    }

    /// Remove by wire ids. Malformed ids reject the whole call; unknown ids
    /// are skipped.
    pub async fn remove(&self, ids: &[IdValue]) -> Result<usize, BridgeError> {
        let ids = parse_ids(ids)?;
        Ok(self.engine.remove(&ids).await?)
    }
}

fn first_arg<T: DeserializeOwned>(args: &Value) -> Result<T, BridgeError> {
    let first = args
        .get(0)
        .filter(|v| v.is_object())
        .ok_or_else(|| RequestError::Malformed("expected an object as the first argument".into()))?;

    serde_json::from_value(first.clone())
        .map_err(|e| BridgeError::InvalidRequest(RequestError::Malformed(e.to_string())))
}
