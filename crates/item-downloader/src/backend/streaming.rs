//! Backend for internal-storage parts, driven by the in-process fetcher.

use std::sync::Arc;

use tracing::debug;

use super::{BackendKind, TransferBackend, TransferCheck, TransferHandle};
use crate::Result;
use crate::fetcher::{FetchCallback, StreamingFetcher};
use crate::model::{DownloadItem, DownloadItemPart};

/// Streams internal parts straight into their final destination.
pub struct StreamingBackend {
    fetcher: Arc<StreamingFetcher>,
}

impl StreamingBackend {
    pub fn new(fetcher: Arc<StreamingFetcher>) -> Self {
        Self { fetcher }
    }
}

impl TransferBackend for StreamingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    fn start(
        &self,
        _item: &DownloadItem,
        part: &DownloadItemPart,
        events: FetchCallback,
    ) -> Result<TransferHandle> {
        let destination = part.transfer_path();
        debug!(
            item_id = %part.item_id,
            part_id = %part.id,
            path = %destination.display(),
            "Starting streaming transfer"
        );
        let handle = self.fetcher.fetch(&part.server_url, destination, events);
        Ok(TransferHandle::Streaming(handle))
    }

    fn poll(&self, _handle: &TransferHandle) -> Option<TransferCheck> {
        None
    }

    fn cancel(&self, handle: &TransferHandle) {
        if let TransferHandle::Streaming(fetch) = handle {
            fetch.cancel();
        }
    }
}
