use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::storage_paths::sanitize_document_name;

pub const DEFAULT_TAIL_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogKind {
    Info,
    Success,
    Error,
    Warning,
}

impl RunLogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunLogKind::Info => "info",
            RunLogKind::Success => "success",
            RunLogKind::Error => "error",
            RunLogKind::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RunLogKind,
    pub message: String,
}

impl RunLogEntry {
    pub fn now(kind: RunLogKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogTail {
    pub entries: Vec<RunLogEntry>,
    pub failed_count: usize,
}

/// Append-only `<name>.jsonl` files, one per run.
#[derive(Debug, Clone)]
pub struct RunLogStore {
    dir: PathBuf,
}

impl RunLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let stem =
            sanitize_document_name(name).ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        Ok(self.dir.join(format!("{stem}.jsonl")))
    }

    pub async fn append(&self, name: &str, entry: &RunLogEntry) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    /// Last `max_lines` lines. Lines that do not parse are counted, not
    /// returned. A missing log is empty.
    pub async fn tail(&self, name: &str, max_lines: usize) -> Result<RunLogTail, StoreError> {
        let path = self.path_for(name)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RunLogTail::default())
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(max_lines);
        let mut tail = RunLogTail::default();
        for line in &lines[start..] {
            match serde_json::from_str::<RunLogEntry>(line) {
                Ok(entry) => tail.entries.push(entry),
                Err(_) => tail.failed_count += 1,
            }
        }
        Ok(tail)
    }

    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
