use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const STORAGE_LAYOUT_VERSION: u32 = 1;

pub const STATE_DIR_ENV: &str = "SWEEP_STATE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepPaths {
    pub root: PathBuf,
    pub states_dir: PathBuf,
    pub state_logs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
    pub storage_version_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageVersionMarker {
    version: u32,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl SweepPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let states_dir = root.join("states");
        Self {
            state_logs_dir: states_dir.join("logs"),
            states_dir,
            logs_dir: root.join("logs"),
            config_path: root.join("config.json"),
            storage_version_path: root.join("storage_version.json"),
            root,
        }
    }

    /// Creates the directory tree and writes the layout marker on first use.
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.root, &self.states_dir, &self.state_logs_dir, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        if !self.storage_version_path.exists() {
            let marker = StorageVersionMarker {
                version: STORAGE_LAYOUT_VERSION,
                created_at: chrono::Utc::now(),
            };
            fs::write(
                &self.storage_version_path,
                serde_json::to_string_pretty(&marker)?,
            )
            .with_context(|| format!("Failed to write {:?}", self.storage_version_path))?;
        }
        Ok(())
    }
}

/// Explicit flag, then `SWEEP_STATE_DIR`, then the platform data dir.
pub fn resolve_state_root(explicit: Option<&str>) -> PathBuf {
    if let Some(dir) = explicit.map(str::trim).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::data_dir()
        .map(|base| base.join("sweep"))
        .unwrap_or_else(|| PathBuf::from(".sweep"))
}

/// Accepts `name` or `name.json`; rejects anything that could escape the
/// store directory.
pub fn sanitize_document_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    let stem = trimmed.strip_suffix(".json").unwrap_or(trimmed);
    if stem.is_empty()
        || stem.contains('/')
        || stem.contains('\\')
        || stem.contains("..")
        || stem.starts_with('.')
    {
        return None;
    }
    Some(stem.to_string())
}
