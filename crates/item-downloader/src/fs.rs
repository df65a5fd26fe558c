//! Filesystem helpers shared across modules.
//!
//! These helpers give IO errors consistent context (operation + path) and keep
//! artifact cleanup in one place.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result};

/// Convert an IO error into a crate error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure the parent directory of a file path exists with a custom operation label.
pub async fn ensure_parent_dir_with_op(op: &'static str, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(op, parent, e))
}

/// Remove a file, treating a missing file as success.
///
/// Returns whether a file was removed.
///
/// Synchronous: the queue calls it while holding its state lock so a deletion
/// is ordered before any re-dispatch of the same part. The cost is a blocking
/// unlink on the calling tokio worker, which stays short for local files.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("removing file", path, e)),
    }
}

/// Best-effort removal of leftover transfer artifacts. Blocking, see
/// [`remove_file_if_exists`].
pub fn remove_artifacts<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        let path = path.as_ref();
        match remove_file_if_exists(path) {
            Ok(true) => debug!(path = %path.display(), "Removed artifact"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to remove artifact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_file_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.part");
        std::fs::write(&path, b"x").unwrap();

        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn test_remove_artifacts_skips_missing() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present");
        std::fs::write(&present, b"x").unwrap();

        remove_artifacts(&[present.clone(), temp.path().join("missing")]);
        assert!(!present.exists());
    }

    #[tokio::test]
    async fn test_ensure_parent_dir() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a").join("b").join("c.mp3");
        ensure_parent_dir_with_op("creating output directory", &file)
            .await
            .unwrap();
        assert!(temp.path().join("a").join("b").is_dir());
    }
}
