//! Durable storage of queued items.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::Result;
use crate::model::DownloadItem;

/// Persistence for download items.
///
/// The queue saves an item on every state transition and removes it once it
/// completes or is cancelled. Failures are logged by the caller, never rolled
/// back.
pub trait ItemStore: Send + Sync {
    fn save_item(&self, item: &DownloadItem) -> Result<()>;

    fn remove_item(&self, item_id: &str) -> Result<()>;

    /// Items saved by a previous run, for [`restore`](crate::DownloadQueueManager::restore).
    fn load_items(&self) -> Result<Vec<DownloadItem>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<HashMap<String, DownloadItem>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_id: &str) -> Option<DownloadItem> {
        self.items.read().get(item_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl ItemStore for MemoryItemStore {
    fn save_item(&self, item: &DownloadItem) -> Result<()> {
        self.items.write().insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn remove_item(&self, item_id: &str) -> Result<()> {
        self.items.write().remove(item_id);
        Ok(())
    }

    fn load_items(&self) -> Result<Vec<DownloadItem>> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemStatus, LocalFolder};

    #[test]
    fn test_memory_store_save_overwrites_and_removes() {
        let store = MemoryItemStore::new();
        let mut item = DownloadItem::new("a", "Book", LocalFolder::new("f", "/tmp"), vec![]);
        store.save_item(&item).unwrap();

        item.set_status(ItemStatus::Failed, Some("boom".into()));
        store.save_item(&item).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().status, ItemStatus::Failed);

        store.remove_item("a").unwrap();
        store.remove_item("missing").unwrap();
        assert!(store.is_empty());
        assert!(store.load_items().unwrap().is_empty());
    }
}
