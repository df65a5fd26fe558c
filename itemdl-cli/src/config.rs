//! Layered configuration: defaults, optional JSON file, `ITEMDL_*`
//! environment variables, then command line flags.

use std::path::{Path, PathBuf};

use anyhow::Context;
use item_downloader::QueueConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Args;

pub const DEFAULT_STATE_DIR: &str = ".itemdl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    /// Item store and staging files live here.
    pub state_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl AppConfig {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.queue.apply_env()?;

        if let Some(dir) = &args.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(max) = args.max_concurrent {
            config.queue.max_concurrent = max;
        }
        if let Some(ms) = args.poll_interval_ms {
            config.queue.poll_interval_ms = ms;
        }
        config.queue.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn items_dir(&self) -> PathBuf {
        self.state_dir.join("items")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_file_then_flags() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("itemdl.json");
        std::fs::write(
            &path,
            r#"{"queue": {"max_concurrent": 5, "poll_interval_ms": 250}, "state_dir": "/var/lib/itemdl"}"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "itemdl",
            "--config",
            path.to_str().unwrap(),
            "--max-concurrent",
            "2",
            "resume",
        ]);
        let config = AppConfig::load(&args).unwrap();

        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.poll_interval_ms, 250);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/itemdl"));
        assert_eq!(config.items_dir(), PathBuf::from("/var/lib/itemdl/items"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let args = Args::parse_from(["itemdl", "--max-concurrent", "0", "list"]);
        assert!(AppConfig::load(&args).is_err());
    }
}
