//! Transfer backends.
//!
//! A part is transferred either in-process by the [`StreamingBackend`], which
//! pushes progress and its outcome through a callback, or by an OS-level
//! service behind the [`ExternalServiceBackend`], which the watch loop polls.
//! The part's `is_internal_storage` flag selects the backend.

pub mod external;
pub mod streaming;

use std::fmt;

pub use external::{
    ExternalServiceBackend, ExternalTransferService, FailureReason, NotificationVisibility,
    TransferQuery, TransferRequest, TransferStatus,
};
pub use streaming::StreamingBackend;

use crate::Result;
use crate::fetcher::{FetchCallback, FetchHandle};
use crate::model::{DownloadItem, DownloadItemPart};

/// Which backend owns a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process streaming fetcher.
    Streaming,
    /// OS-level transfer service.
    External,
}

impl BackendKind {
    pub fn for_part(part: &DownloadItemPart) -> Self {
        if part.is_internal_storage {
            Self::Streaming
        } else {
            Self::External
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::External => "external",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime handle of a started transfer.
#[derive(Debug, Clone)]
pub enum TransferHandle {
    Streaming(FetchHandle),
    External(i64),
}

impl TransferHandle {
    /// Opaque id stored on the part as `download_id`.
    pub fn id(&self) -> i64 {
        match self {
            Self::Streaming(handle) => handle.id(),
            Self::External(id) => *id,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Streaming(_) => BackendKind::Streaming,
            Self::External(_) => BackendKind::External,
        }
    }
}

/// Disposition of a transfer as seen by the watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCheck {
    InProgress { bytes_so_far: u64, total_bytes: u64 },
    Successful { bytes_so_far: u64, total_bytes: u64 },
    Failed { message: String },
    /// The backend no longer knows the transfer.
    Missing,
}

impl TransferCheck {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}

/// Capability shared by both transfer backends.
pub trait TransferBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start transferring `part`.
    ///
    /// Push-driven backends deliver progress and their outcome through
    /// `events` and must never invoke it before returning. Polled backends
    /// ignore it.
    fn start(
        &self,
        item: &DownloadItem,
        part: &DownloadItemPart,
        events: FetchCallback,
    ) -> Result<TransferHandle>;

    /// Current disposition of a transfer, or `None` for push-driven backends.
    fn poll(&self, handle: &TransferHandle) -> Option<TransferCheck>;

    /// Fire-and-forget cancellation.
    fn cancel(&self, handle: &TransferHandle);
}
