//! Item store keeping one JSON file per item.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use item_downloader::fs::{io_error, remove_file_if_exists};
use item_downloader::{DownloadItem, ItemStore, Result};
use tracing::{debug, warn};

pub struct JsonDirItemStore {
    dir: PathBuf,
}

impl JsonDirItemStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error("creating item store", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_id(item_id)))
    }
}

/// File-name-safe form of an id. Bytes outside `[A-Za-z0-9_-]` become `%XX`,
/// so distinct ids never share a name.
pub fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            escaped.push(b as char);
        } else {
            let _ = write!(escaped, "%{b:02X}");
        }
    }
    escaped
}

impl ItemStore for JsonDirItemStore {
    fn save_item(&self, item: &DownloadItem) -> Result<()> {
        let path = self.path_for(&item.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(item)?;
        std::fs::write(&tmp, json).map_err(|e| io_error("writing item", &tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error("replacing item", &path, e))?;
        debug!(item_id = %item.id, path = %path.display(), "Saved item");
        Ok(())
    }

    fn remove_item(&self, item_id: &str) -> Result<()> {
        remove_file_if_exists(&self.path_for(item_id))?;
        Ok(())
    }

    fn load_items(&self) -> Result<Vec<DownloadItem>> {
        let mut items = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error("listing items", &self.dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_error("listing items", &self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(&path).map_err(|e| io_error("reading item", &path, e))?;
            match serde_json::from_slice::<DownloadItem>(&raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable item"),
            }
        }
        items.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use item_downloader::{DownloadItemPart, ItemStatus, LocalFolder};
    use tempfile::TempDir;

    fn item(id: &str) -> DownloadItem {
        DownloadItem::new(
            id,
            "Book",
            LocalFolder::new("folder", "/library"),
            vec![DownloadItemPart::new(
                "p1",
                id,
                "01.mp3",
                "http://server/1",
                "/staging/1",
                "/library/Book/01.mp3",
            )],
        )
    }

    #[test]
    fn test_save_load_remove() {
        let temp = TempDir::new().unwrap();
        let store = JsonDirItemStore::open(temp.path().join("items")).unwrap();

        let mut a = item("li/a");
        store.save_item(&a).unwrap();
        store.save_item(&item("b")).unwrap();

        a.set_status(ItemStatus::Failed, Some("File error".into()));
        store.save_item(&a).unwrap();

        let loaded = store.load_items().unwrap();
        assert_eq!(loaded.len(), 2);
        let a_loaded = loaded.iter().find(|i| i.id == "li/a").unwrap();
        assert_eq!(a_loaded.status, ItemStatus::Failed);
        assert_eq!(a_loaded.parts[0].server_url, "http://server/1");

        store.remove_item("li/a").unwrap();
        store.remove_item("li/a").unwrap();
        assert_eq!(store.load_items().unwrap().len(), 1);
    }

    #[test]
    fn test_similar_ids_do_not_share_a_file() {
        let temp = TempDir::new().unwrap();
        let store = JsonDirItemStore::open(temp.path()).unwrap();
        store.save_item(&item("li/a")).unwrap();
        store.save_item(&item("li_a")).unwrap();
        store.save_item(&item("li%2Fa")).unwrap();

        let mut ids: Vec<_> = store.load_items().unwrap().into_iter().map(|i| i.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["li%2Fa", "li/a", "li_a"]);

        store.remove_item("li/a").unwrap();
        assert_eq!(store.load_items().unwrap().len(), 2);
        assert_eq!(escape_id("li/a"), "li%2Fa");
        assert_eq!(escape_id("li%2Fa"), "li%252Fa");
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        let store = JsonDirItemStore::open(temp.path()).unwrap();
        std::fs::write(temp.path().join("broken.json"), b"{").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"ignored").unwrap();
        store.save_item(&item("ok")).unwrap();

        let loaded = store.load_items().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "ok");
    }
}
