//! Backend for parts handed to an OS-level transfer service.
//!
//! The service owns its own retry and resume logic. The queue submits a
//! request, keeps the returned id and polls the service from the watch loop.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BackendKind, TransferBackend, TransferCheck, TransferHandle};
use crate::Result;
use crate::fetcher::FetchCallback;
use crate::model::{DownloadItem, DownloadItemPart};

/// Visibility of the service's progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationVisibility {
    Hidden,
    Visible,
    #[default]
    VisibleNotifyCompleted,
}

/// Transfer submitted to the external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub url: String,
    /// Staging path the service writes to.
    pub destination: PathBuf,
    pub title: String,
    pub description: String,
    pub allow_metered: bool,
    pub allow_roaming: bool,
    pub notification_visibility: NotificationVisibility,
}

impl TransferRequest {
    pub fn for_part(item: &DownloadItem, part: &DownloadItemPart) -> Self {
        Self {
            url: part.server_url.clone(),
            destination: part.staging_path.clone(),
            title: part.filename.clone(),
            description: format!("Downloading {}", item.title),
            allow_metered: true,
            allow_roaming: true,
            notification_visibility: NotificationVisibility::default(),
        }
    }
}

/// Status reported by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed,
}

/// Result of querying the external service for one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferQuery {
    pub status: TransferStatus,
    pub bytes_so_far: u64,
    /// 0 when unknown.
    pub total_bytes: u64,
    /// Service failure code, present when `status` is `Failed`.
    pub failure_reason: Option<i32>,
}

impl TransferQuery {
    /// Map the raw query onto the queue's view of a transfer.
    pub fn to_check(&self) -> TransferCheck {
        match self.status {
            TransferStatus::Pending | TransferStatus::Running | TransferStatus::Paused => {
                TransferCheck::InProgress {
                    bytes_so_far: self.bytes_so_far,
                    total_bytes: self.total_bytes,
                }
            }
            TransferStatus::Successful => TransferCheck::Successful {
                bytes_so_far: self.bytes_so_far,
                total_bytes: self.total_bytes,
            },
            TransferStatus::Failed => TransferCheck::Failed {
                message: FailureReason::from_code(self.failure_reason.unwrap_or(1000)).to_string(),
            },
        }
    }
}

/// OS-level asynchronous download service.
pub trait ExternalTransferService: Send + Sync {
    /// Enqueue a transfer, returning its id.
    fn submit(&self, request: &TransferRequest) -> Result<i64>;

    /// `None` when the service does not know the id.
    fn query(&self, download_id: i64) -> Option<TransferQuery>;

    fn cancel(&self, download_id: i64);
}

/// Failure codes reported by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Unknown,
    FileError,
    UnhandledHttpResponse,
    HttpDataError,
    TooManyRedirects,
    InsufficientSpace,
    DestinationNotFound,
    CannotResume,
    FileAlreadyExists,
    Other(i32),
}

impl FailureReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            1000 => Self::Unknown,
            1001 => Self::FileError,
            1002 => Self::UnhandledHttpResponse,
            1004 => Self::HttpDataError,
            1005 => Self::TooManyRedirects,
            1006 => Self::InsufficientSpace,
            1007 => Self::DestinationNotFound,
            1008 => Self::CannotResume,
            1009 => Self::FileAlreadyExists,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown error"),
            Self::FileError => f.write_str("File error"),
            Self::UnhandledHttpResponse => f.write_str("Unhandled HTTP response"),
            Self::HttpDataError => f.write_str("HTTP data error"),
            Self::TooManyRedirects => f.write_str("Too many redirects"),
            Self::InsufficientSpace => f.write_str("Insufficient space"),
            Self::DestinationNotFound => f.write_str("Destination folder not found"),
            Self::CannotResume => f.write_str("Cannot resume download"),
            Self::FileAlreadyExists => f.write_str("File already exists"),
            Self::Other(code) => write!(f, "Download error ({code})"),
        }
    }
}

/// Adapts an [`ExternalTransferService`] to the [`TransferBackend`] capability.
pub struct ExternalServiceBackend {
    service: Arc<dyn ExternalTransferService>,
}

impl ExternalServiceBackend {
    pub fn new(service: Arc<dyn ExternalTransferService>) -> Self {
        Self { service }
    }
}

impl TransferBackend for ExternalServiceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn start(
        &self,
        item: &DownloadItem,
        part: &DownloadItemPart,
        _events: FetchCallback,
    ) -> Result<TransferHandle> {
        let request = TransferRequest::for_part(item, part);
        let download_id = self.service.submit(&request)?;
        debug!(
            item_id = %item.id,
            part_id = %part.id,
            download_id,
            "Submitted external transfer"
        );
        Ok(TransferHandle::External(download_id))
    }

    fn poll(&self, handle: &TransferHandle) -> Option<TransferCheck> {
        let TransferHandle::External(download_id) = handle else {
            return None;
        };
        match self.service.query(*download_id) {
            Some(query) => Some(query.to_check()),
            None => {
                warn!(download_id, "Transfer not found in the transfer service");
                Some(TransferCheck::Missing)
            }
        }
    }

    fn cancel(&self, handle: &TransferHandle) {
        if let TransferHandle::External(download_id) = handle {
            self.service.cancel(*download_id);
        }
    }
}
