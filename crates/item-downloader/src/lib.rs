//! # Item Downloader
//!
//! Coordinates downloading multi-part media items (tracks, covers, ebooks) from
//! a remote server to local storage.
//!
//! ## Features
//!
//! - FIFO item queue with a global ceiling on concurrent part transfers
//! - In-process streaming fetcher for internal-storage parts
//! - Pluggable OS-level transfer service for everything else, polled by a
//!   single watch loop
//! - Relocation of finished files into their final folder
//! - Retry, resume, cancel and restore after restart
//! - Events over a broadcast channel
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod fs;
pub mod manager;
pub mod model;
pub mod relocation;
pub mod scanner;
pub mod store;

pub use backend::{
    BackendKind, ExternalServiceBackend, ExternalTransferService, FailureReason,
    NotificationVisibility, StreamingBackend, TransferBackend, TransferCheck, TransferHandle,
    TransferQuery, TransferRequest, TransferStatus,
};
pub use config::{FetcherConfig, QueueConfig};
pub use error::{Error, Result};
pub use events::{CompletionPayload, QueueEvent};
pub use fetcher::{FetchCallback, FetchEvent, FetchHandle, StreamingFetcher};
pub use manager::{DownloadQueueManager, DownloadQueueManagerBuilder};
pub use model::{DownloadItem, DownloadItemPart, ItemStatus, LocalFolder, PartKind, PartState};
pub use relocation::{
    FsRelocationService, MimeHint, RelocatedFile, RelocationError, RelocationRequest,
    RelocationService,
};
pub use scanner::{ItemScanner, NoopScanner, ScanResult};
pub use store::{ItemStore, MemoryItemStore};
