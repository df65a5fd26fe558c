//! Events broadcast by the download queue.

use serde::{Deserialize, Serialize};

use crate::model::{DownloadItem, DownloadItemPart};
use crate::scanner::ScanResult;

/// Payload of [`QueueEvent::ItemCompleted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub item_id: String,
    pub local_folder_id: String,
    #[serde(flatten)]
    pub scan: Option<ScanResult>,
}

/// One event per logical transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    ItemAdded {
        item: DownloadItem,
    },
    PartUpdated {
        part: DownloadItemPart,
    },
    ItemFailed {
        item: DownloadItem,
        part: DownloadItemPart,
        message: String,
    },
    ItemCancelled {
        item_id: String,
    },
    ItemCompleted(CompletionPayload),
}

impl QueueEvent {
    /// Id of the item the event concerns.
    pub fn item_id(&self) -> &str {
        match self {
            Self::ItemAdded { item } => &item.id,
            Self::PartUpdated { part } => &part.item_id,
            Self::ItemFailed { item, .. } => &item.id,
            Self::ItemCancelled { item_id } => item_id,
            Self::ItemCompleted(payload) => &payload.item_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ItemAdded { .. } => "item_added",
            Self::PartUpdated { .. } => "part_updated",
            Self::ItemFailed { .. } => "item_failed",
            Self::ItemCancelled { .. } => "item_cancelled",
            Self::ItemCompleted(_) => "item_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_payload_json() {
        let event = QueueEvent::ItemCompleted(CompletionPayload {
            item_id: "li_1".into(),
            local_folder_id: "folder".into(),
            scan: Some(ScanResult {
                local_library_item: Some(serde_json::json!({"id": "local_1"})),
                local_media_progress: None,
            }),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_completed");
        assert_eq!(json["itemId"], "li_1");
        assert_eq!(json["localFolderId"], "folder");
        assert_eq!(json["localLibraryItem"]["id"], "local_1");
        assert!(json.get("localMediaProgress").is_none());
        assert_eq!(event.item_id(), "li_1");
    }
}
