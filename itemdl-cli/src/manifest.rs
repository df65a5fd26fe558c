//! Download manifests: the items a `run` should queue.
//!
//! ```json
//! {
//!   "items": [{
//!     "id": "li_1",
//!     "title": "Book",
//!     "localFolder": { "id": "internal", "basePath": "/books" },
//!     "parts": [
//!       { "id": "t1", "filename": "01.mp3", "serverUrl": "https://host/t1", "subfolder": "Book", "kind": "audio_track" }
//!     ]
//!   }]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use item_downloader::{DownloadItem, DownloadItemPart, LocalFolder, PartKind};
use serde::Deserialize;

use crate::store::escape_id;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub items: Vec<ManifestItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub local_folder: LocalFolder,
    pub parts: Vec<ManifestPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPart {
    pub id: String,
    pub filename: String,
    pub server_url: String,
    #[serde(default)]
    pub subfolder: String,
    /// Fetch in-process straight into the final folder.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub kind: PartKind,
    #[serde(default)]
    pub file_size: u64,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing manifest {}", path.display()))
    }

    /// Resolve staging and final paths for every part.
    pub fn into_items(self, staging_dir: &Path) -> Vec<DownloadItem> {
        self.items
            .into_iter()
            .map(|item| item.into_item(staging_dir))
            .collect()
    }
}

impl ManifestItem {
    pub fn into_item(self, staging_dir: &Path) -> DownloadItem {
        let item_dir = staging_dir.join(escape_id(&self.id));
        let parts = self
            .parts
            .into_iter()
            .map(|part| {
                let mut final_path = self.local_folder.base_path.clone();
                if !part.subfolder.is_empty() {
                    final_path.push(&part.subfolder);
                }
                final_path.push(&part.filename);

                let staging = if part.internal {
                    final_path.clone()
                } else {
                    item_dir.join(format!("{}.part", escape_id(&part.id)))
                };

                let built = DownloadItemPart::new(
                    part.id,
                    self.id.clone(),
                    part.filename,
                    part.server_url,
                    staging,
                    final_path,
                )
                .with_subfolder(part.subfolder)
                .with_kind(part.kind)
                .with_file_size(part.file_size);
                if part.internal { built.internal() } else { built }
            })
            .collect();

        let item = DownloadItem::new(self.id, self.title, self.local_folder, parts);
        match self.subtitle {
            Some(subtitle) => item.with_subtitle(subtitle),
            None => item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MANIFEST: &str = r#"{
        "items": [{
            "id": "li_1",
            "title": "Book",
            "subtitle": "Author",
            "localFolder": { "id": "internal", "basePath": "/books" },
            "parts": [
                { "id": "t1", "filename": "01.mp3", "serverUrl": "https://host/t1", "subfolder": "Book", "kind": "audio_track", "fileSize": 100 },
                { "id": "c/1", "filename": "cover.jpg", "serverUrl": "https://host/cover", "subfolder": "Book", "internal": true, "kind": "cover" }
            ]
        }]
    }"#;

    #[test]
    fn test_paths_resolved() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let items = manifest.into_items(Path::new("/state/staging"));
        assert_eq!(items.len(), 1);

        let item = &items[0];
        assert_eq!(item.subtitle.as_deref(), Some("Author"));

        let track = &item.parts[0];
        assert!(!track.is_internal_storage);
        assert_eq!(track.item_id, "li_1");
        assert_eq!(track.staging_path, PathBuf::from("/state/staging/li_1/t1.part"));
        assert_eq!(track.final_destination_path, PathBuf::from("/books/Book/01.mp3"));
        assert_eq!(track.file_size, 100);

        let cover = &item.parts[1];
        assert!(cover.is_internal_storage);
        assert_eq!(cover.kind, PartKind::Cover);
        assert_eq!(cover.staging_path, cover.final_destination_path);
        assert_eq!(cover.final_destination_path, PathBuf::from("/books/Book/cover.jpg"));
    }
}
