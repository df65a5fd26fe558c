//! Post-download scanning of finished items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::DownloadItem;

/// What a scan produced for a finished item. Opaque to the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_library_item: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_media_progress: Option<serde_json::Value>,
}

/// Turns a finished download into a library entry.
#[async_trait]
pub trait ItemScanner: Send + Sync {
    /// Called exactly once per finished item.
    async fn scan_completed_item(&self, item: &DownloadItem) -> Option<ScanResult>;
}

/// Scanner that produces nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopScanner;

#[async_trait]
impl ItemScanner for NoopScanner {
    async fn scan_completed_item(&self, _item: &DownloadItem) -> Option<ScanResult> {
        None
    }
}
