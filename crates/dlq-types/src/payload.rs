//! Wire payloads accepted by the bridge
//!
//! Field names follow the JSON contract of the web-view bridge
//! (`uri`, `mimeType`, `destinationInExternalFilesDir`, ...). Payloads are
//! permissive on input and converted into validated domain types.

use crate::{
    parse_source_uri, Destination, DownloadId, DownloadQuery, DownloadRequest,
    NotificationVisibility, RequestError, StatusFilter,
};
use serde::Deserialize;
use url::Url;

/// `{dirType, subPath}` destination parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirPayload {
    pub dir_type: Option<String>,
    pub sub_path: Option<String>,
}

/// Raw `enqueue` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub uri: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub destination_in_external_files_dir: Option<DirPayload>,
    pub destination_in_external_public_dir: Option<DirPayload>,
    pub destination_uri: Option<String>,
    pub visible_in_downloads_ui: Option<bool>,
    pub notification_visibility: Option<i64>,
}

impl TryFrom<RequestPayload> for DownloadRequest {
    type Error = RequestError;

    fn try_from(payload: RequestPayload) -> Result<Self, Self::Error> {
        let raw_uri = payload.uri.ok_or(RequestError::MissingField("uri"))?;
        let uri = parse_source_uri(&raw_uri)?;

        let mut chosen = Vec::new();
        if payload.destination_in_external_files_dir.is_some() {
            chosen.push("destinationInExternalFilesDir");
        }
        if payload.destination_in_external_public_dir.is_some() {
            chosen.push("destinationInExternalPublicDir");
        }
        if payload.destination_uri.is_some() {
            chosen.push("destinationUri");
        }
        if chosen.len() > 1 {
            return Err(RequestError::AmbiguousDestination(chosen.join(", ")));
        }

        let destination = if let Some(dir) = payload.destination_in_external_files_dir {
            Destination::AppPrivate {
                dir_type: non_empty(dir.dir_type),
                sub_path: non_empty(dir.sub_path),
            }
        } else if let Some(dir) = payload.destination_in_external_public_dir {
            Destination::SharedPublic {
                dir_type: non_empty(dir.dir_type),
                sub_path: non_empty(dir.sub_path),
            }
        } else if let Some(raw) = payload.destination_uri {
            let uri = Url::parse(raw.trim()).map_err(|e| {
                RequestError::InvalidDestination(format!("`{}`: {}", raw, e))
            })?;
            Destination::Uri { uri }
        } else {
            Destination::default()
        };

        let notification_visibility = match payload.notification_visibility {
            Some(code) => NotificationVisibility::from_code(code)?,
            None => NotificationVisibility::default(),
        };

        let request = DownloadRequest {
            uri,
            title: non_empty(payload.title),
            description: non_empty(payload.description),
            mime_type: non_empty(payload.mime_type),
            destination,
            visible_in_downloads_ui: payload.visible_in_downloads_ui.unwrap_or(true),
            notification_visibility,
        };
        request.validate()?;
        Ok(request)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// An id on the wire: string-encoded integers, bare integers tolerated
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Number(i64),
    Text(String),
}

impl IdValue {
    pub fn parse(&self) -> Result<DownloadId, RequestError> {
        match self {
            IdValue::Number(n) => Ok(*n),
            IdValue::Text(s) => s
                .parse::<DownloadId>()
                .map_err(|_| RequestError::InvalidId(s.clone())),
        }
    }
}

/// Parse a list of wire ids, failing on the first malformed entry
pub fn parse_ids(values: &[IdValue]) -> Result<Vec<DownloadId>, RequestError> {
    values.iter().map(IdValue::parse).collect()
}

/// Raw `query` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryPayload {
    pub ids: Option<Vec<IdValue>>,
    pub status: Option<i64>,
}

impl QueryPayload {
    /// Convert into a query, using `default_filter` when no mask is given
    pub fn into_query(self, default_filter: &StatusFilter) -> Result<DownloadQuery, RequestError> {
        let ids = match self.ids {
            Some(ids) => parse_ids(&ids)?,
            None => Vec::new(),
        };
        let statuses = match self.status {
            Some(mask) => StatusFilter::from_mask(mask),
            None => default_filter.clone(),
        };
        Ok(DownloadQuery { ids, statuses })
    }
}
