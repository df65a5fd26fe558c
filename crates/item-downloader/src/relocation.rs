//! Moving finished files from staging into their final location.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::model::{DownloadItem, DownloadItemPart, LocalFolder, PartKind};

/// Relocation error codes used by [`FsRelocationService`].
pub mod codes {
    pub const SOURCE_MISSING: i32 = 1;
    pub const TARGET_FOLDER: i32 = 2;
    pub const MOVE_FAILED: i32 = 3;
    pub const RENAME_FAILED: i32 = 4;
}

/// Broad content type of a relocated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeHint {
    Audio,
    Image,
    Document,
    Any,
}

impl MimeHint {
    pub fn for_kind(kind: PartKind) -> Self {
        match kind {
            PartKind::AudioTrack => Self::Audio,
            PartKind::Cover => Self::Image,
            PartKind::Ebook => Self::Document,
            PartKind::Other => Self::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio/*",
            Self::Image => "image/*",
            Self::Document => "application/*",
            Self::Any => "*/*",
        }
    }
}

/// Move request for one finished part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRequest {
    pub source: PathBuf,
    pub local_folder: LocalFolder,
    /// Relative to the local folder, empty for the folder itself.
    pub subfolder: String,
    /// Requested name; the realized name may differ.
    pub filename: String,
    pub mime: MimeHint,
}

impl RelocationRequest {
    pub fn for_part(item: &DownloadItem, part: &DownloadItemPart) -> Self {
        Self {
            source: part.staging_path.clone(),
            local_folder: item.local_folder.clone(),
            subfolder: part.final_destination_subfolder.clone(),
            filename: part.filename.clone(),
            mime: MimeHint::for_kind(part.kind),
        }
    }

    pub fn target_dir(&self) -> PathBuf {
        if self.subfolder.is_empty() {
            self.local_folder.base_path.clone()
        } else {
            self.local_folder.base_path.join(&self.subfolder)
        }
    }
}

/// A file at its final location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedFile {
    pub path: PathBuf,
    /// Realized file name.
    pub name: String,
}

impl RelocatedFile {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, name }
    }
}

/// Relocation failure with the backend's error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("relocation error {code}: {message}")]
pub struct RelocationError {
    pub code: i32,
    pub message: String,
}

impl RelocationError {
    pub fn new(code: i32, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait RelocationService: Send + Sync {
    /// Move `request.source` into the target folder.
    async fn relocate(&self, request: RelocationRequest) -> Result<RelocatedFile, RelocationError>;

    /// Rename a relocated file in place.
    async fn rename(&self, file: &RelocatedFile, name: &str) -> Result<RelocatedFile, RelocationError>;
}

/// Whether a realized name carries a spurious `.mp3` appended to an m4a/m4b name.
pub fn has_appended_extension(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".m4b.mp3") || lower.ends_with(".m4a.mp3")
}

/// Relocate and correct a mangled realized name by renaming it to the requested one.
pub async fn relocate_and_reconcile(
    service: &dyn RelocationService,
    request: RelocationRequest,
) -> Result<RelocatedFile, RelocationError> {
    let filename = request.filename.clone();
    let file = service.relocate(request).await?;
    if file.name != filename && has_appended_extension(&file.name) {
        debug!(realized = %file.name, requested = %filename, "Renaming relocated file");
        return match service.rename(&file, &filename).await {
            Ok(renamed) => Ok(renamed),
            Err(e) => {
                // The file is in place, only its name is off.
                warn!(path = %file.path.display(), error = %e, "Failed to rename relocated file");
                Ok(file)
            }
        };
    }
    Ok(file)
}

/// Moves files within the local filesystem, copying across devices.
#[derive(Debug, Default, Clone)]
pub struct FsRelocationService;

impl FsRelocationService {
    pub fn new() -> Self {
        Self
    }

    async fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
        match tokio::fs::rename(source, target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Rename failed, falling back to copy");
                tokio::fs::copy(source, target).await?;
                tokio::fs::remove_file(source).await
            }
        }
    }
}

#[async_trait]
impl RelocationService for FsRelocationService {
    async fn relocate(&self, request: RelocationRequest) -> Result<RelocatedFile, RelocationError> {
        if !tokio::fs::try_exists(&request.source).await.unwrap_or(false) {
            return Err(RelocationError::new(
                codes::SOURCE_MISSING,
                format!("source {} does not exist", request.source.display()),
            ));
        }

        let dir = request.target_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RelocationError::new(codes::TARGET_FOLDER, e))?;

        let target = dir.join(&request.filename);
        Self::move_file(&request.source, &target)
            .await
            .map_err(|e| RelocationError::new(codes::MOVE_FAILED, e))?;

        info!(
            path = %target.display(),
            mime = request.mime.as_str(),
            "Relocated file"
        );
        Ok(RelocatedFile::new(target))
    }

    async fn rename(&self, file: &RelocatedFile, name: &str) -> Result<RelocatedFile, RelocationError> {
        let target = file.path.with_file_name(name);
        tokio::fs::rename(&file.path, &target)
            .await
            .map_err(|e| RelocationError::new(codes::RENAME_FAILED, e))?;
        Ok(RelocatedFile::new(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(source: PathBuf, base: &Path, subfolder: &str, filename: &str) -> RelocationRequest {
        RelocationRequest {
            source,
            local_folder: LocalFolder::new("folder", base),
            subfolder: subfolder.to_string(),
            filename: filename.to_string(),
            mime: MimeHint::Audio,
        }
    }

    #[test]
    fn test_appended_extension_detection() {
        assert!(has_appended_extension("Book.m4b.mp3"));
        assert!(has_appended_extension("track.M4A.MP3"));
        assert!(!has_appended_extension("track.mp3"));
        assert!(!has_appended_extension("track.m4b"));
    }

    #[test]
    fn test_mime_hint_for_kind() {
        assert_eq!(MimeHint::for_kind(PartKind::AudioTrack), MimeHint::Audio);
        assert_eq!(MimeHint::for_kind(PartKind::Cover).as_str(), "image/*");
    }

    #[tokio::test]
    async fn test_fs_relocate_into_subfolder() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("staging.tmp");
        tokio::fs::write(&source, b"audio").await.unwrap();
        let library = temp.path().join("library");

        let service = FsRelocationService::new();
        let file = service
            .relocate(request(source.clone(), &library, "Book", "01.mp3"))
            .await
            .unwrap();

        assert_eq!(file.name, "01.mp3");
        assert_eq!(file.path, library.join("Book").join("01.mp3"));
        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&file.path).await.unwrap(), b"audio");
    }

    #[tokio::test]
    async fn test_fs_relocate_missing_source() {
        let temp = TempDir::new().unwrap();
        let service = FsRelocationService::new();
        let err = service
            .relocate(request(temp.path().join("nope"), temp.path(), "", "a.mp3"))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SOURCE_MISSING);
    }

    struct MangledNames;

    #[async_trait]
    impl RelocationService for MangledNames {
        async fn relocate(&self, request: RelocationRequest) -> Result<RelocatedFile, RelocationError> {
            Ok(RelocatedFile::new(
                request.target_dir().join(format!("{}.mp3", request.filename)),
            ))
        }

        async fn rename(&self, file: &RelocatedFile, name: &str) -> Result<RelocatedFile, RelocationError> {
            Ok(RelocatedFile::new(file.path.with_file_name(name)))
        }
    }

    #[tokio::test]
    async fn test_reconcile_renames_appended_extension() {
        let file = relocate_and_reconcile(
            &MangledNames,
            request(PathBuf::from("/s"), Path::new("/lib"), "", "Book.m4b"),
        )
        .await
        .unwrap();
        assert_eq!(file.name, "Book.m4b");
        assert_eq!(file.path, PathBuf::from("/lib/Book.m4b"));

        // Other mismatches are left alone.
        let file = relocate_and_reconcile(
            &MangledNames,
            request(PathBuf::from("/s"), Path::new("/lib"), "", "cover.jpg"),
        )
        .await
        .unwrap();
        assert_eq!(file.name, "cover.jpg.mp3");
    }
}
