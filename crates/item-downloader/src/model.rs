//! Download items and their parts.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Parts are queued or transferring.
    #[default]
    Active,
    /// A part failed; the item waits for retry or cancel.
    Failed,
    /// The queue was shut down while the item was transferring.
    Stopped,
    /// Every part finished.
    Completed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a part holds. Drives the mime hint used during relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    AudioTrack,
    Cover,
    Ebook,
    #[default]
    Other,
}

/// Derived lifecycle state of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Queued,
    InFlight,
    Moving,
    Succeeded,
    Failed,
    Paused,
}

/// Local storage folder an item downloads into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFolder {
    pub id: String,
    pub base_path: PathBuf,
}

impl LocalFolder {
    pub fn new(id: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_path: base_path.into(),
        }
    }
}

/// One file of a download item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItemPart {
    pub id: String,
    /// Id of the owning [`DownloadItem`].
    pub item_id: String,
    pub filename: String,
    pub server_url: String,
    /// Where the transfer writes.
    pub staging_path: PathBuf,
    /// User-visible location once the part is done.
    pub final_destination_path: PathBuf,
    /// Subfolder of the item's local folder that receives the file.
    #[serde(default)]
    pub final_destination_subfolder: String,
    /// Internal parts are fetched in-process, others by the external service.
    #[serde(default)]
    pub is_internal_storage: bool,
    #[serde(default)]
    pub kind: PartKind,
    /// Expected size in bytes, 0 when unknown.
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub bytes_downloaded: u64,
    /// Percent complete, 0-100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub moving: bool,
    #[serde(default)]
    pub moved: bool,
    /// Opaque handle of the backend transfer, set while a transfer exists.
    #[serde(default)]
    pub download_id: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DownloadItemPart {
    pub fn new(
        id: impl Into<String>,
        item_id: impl Into<String>,
        filename: impl Into<String>,
        server_url: impl Into<String>,
        staging_path: impl Into<PathBuf>,
        final_destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            item_id: item_id.into(),
            filename: filename.into(),
            server_url: server_url.into(),
            staging_path: staging_path.into(),
            final_destination_path: final_destination_path.into(),
            final_destination_subfolder: String::new(),
            is_internal_storage: false,
            kind: PartKind::Other,
            file_size: 0,
            bytes_downloaded: 0,
            progress: 0,
            completed: false,
            failed: false,
            paused: false,
            moving: false,
            moved: false,
            download_id: None,
            error_message: None,
        }
    }

    /// Mark the part as fetched in-process straight into its final path.
    pub fn internal(mut self) -> Self {
        self.is_internal_storage = true;
        self
    }

    pub fn with_kind(mut self, kind: PartKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn with_subfolder(mut self, subfolder: impl Into<String>) -> Self {
        self.final_destination_subfolder = subfolder.into();
        self
    }

    /// `completed && !failed`.
    pub fn is_succeeded(&self) -> bool {
        self.completed && !self.failed
    }

    /// Whether admission may start this part.
    pub fn is_eligible(&self) -> bool {
        !self.completed
            && !self.failed
            && !self.paused
            && !self.moving
            && self.download_id.is_none()
    }

    pub fn state(&self) -> PartState {
        if self.failed {
            PartState::Failed
        } else if self.moving {
            PartState::Moving
        } else if self.completed && (self.moved || self.is_internal_storage) {
            PartState::Succeeded
        } else if self.paused {
            PartState::Paused
        } else if self.download_id.is_some() {
            PartState::InFlight
        } else {
            PartState::Queued
        }
    }

    /// Forget everything about the current transfer. Flags describing the
    /// disposition (`failed`, `paused`) are left to the caller.
    pub fn reset_transfer(&mut self) {
        self.download_id = None;
        self.completed = false;
        self.moving = false;
        self.moved = false;
        self.progress = 0;
        self.bytes_downloaded = 0;
    }

    /// Files a failed or restarted transfer may have left behind.
    pub fn artifact_paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.staging_path.as_path()];
        if !self.moved && self.final_destination_path != self.staging_path {
            paths.push(self.final_destination_path.as_path());
        }
        paths
    }

    /// Path the transfer writes to. Internal parts are written in place.
    pub fn transfer_path(&self) -> &Path {
        if self.is_internal_storage {
            &self.final_destination_path
        } else {
            &self.staging_path
        }
    }
}

/// `floor(bytes * 100 / total)`, or 0 when the total is unknown.
pub fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (bytes as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// One logical multi-file download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub local_folder: LocalFolder,
    pub parts: Vec<DownloadItemPart>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl DownloadItem {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        local_folder: LocalFolder,
        parts: Vec<DownloadItemPart>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            subtitle: None,
            local_folder,
            parts,
            status: ItemStatus::Active,
            status_message: None,
            last_updated: Utc::now(),
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    /// True when every part is `completed && !failed`.
    pub fn is_finished(&self) -> bool {
        self.parts.iter().all(DownloadItemPart::is_succeeded)
    }

    /// Up to `limit` parts admission may start, in declared order.
    pub fn next_parts(&self, limit: usize) -> Vec<&DownloadItemPart> {
        self.parts
            .iter()
            .filter(|p| p.is_eligible())
            .take(limit)
            .collect()
    }

    pub fn part(&self, part_id: &str) -> Option<&DownloadItemPart> {
        self.parts.iter().find(|p| p.id == part_id)
    }

    pub fn part_mut(&mut self, part_id: &str) -> Option<&mut DownloadItemPart> {
        self.parts.iter_mut().find(|p| p.id == part_id)
    }

    /// Fraction of expected bytes already on disk, 0.0 to 1.0.
    ///
    /// Completed parts count their downloaded bytes, the rest their declared size.
    pub fn progress(&self) -> f64 {
        let mut total = 0u64;
        let mut downloaded = 0u64;
        for part in &self.parts {
            total += if part.completed {
                part.bytes_downloaded
            } else {
                part.file_size
            };
            downloaded += part.bytes_downloaded;
        }
        if total == 0 {
            return 0.0;
        }
        (downloaded as f64 / total as f64).min(1.0)
    }

    pub fn set_status(&mut self, status: ItemStatus, message: Option<String>) {
        self.status = status;
        self.status_message = message;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
