use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;

use crate::error::StoreError;
use crate::storage_paths::sanitize_document_name;

/// Named JSON documents in a single directory. Knows nothing about what the
/// documents mean.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub name: String,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "data")]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentListing {
    #[serde(rename = "states")]
    pub documents: Vec<StoredDocument>,
    pub failed: Vec<DocumentFailure>,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let stem =
            sanitize_document_name(name).ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        Ok(self.dir.join(format!("{stem}.json")))
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    /// Raw JSON of a document, `None` when it does not exist.
    pub async fn load_value(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(name)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Parse { path, source })
    }

    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let Some(value) = self.load_value(name).await? else {
            return Ok(None);
        };
        let path = self.path_for(name)?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Parse { path, source })
    }

    /// Loads the document, or saves and returns `defaults` when absent.
    pub async fn get_or_create<T>(&self, name: &str, defaults: T) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(existing) = self.load(name).await? {
            return Ok(existing);
        }
        self.save(name, &defaults).await?;
        Ok(defaults)
    }

    /// Overwrites the document through a temp file and rename.
    pub async fn save<T: Serialize>(&self, name: &str, document: &T) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let raw = serde_json::to_string_pretty(document)?;
        atomic_write(&path, &raw).await
    }

    pub async fn list(&self) -> Result<DocumentListing, StoreError> {
        let mut listing = DocumentListing::default();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let updated_at = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(DateTime::<Utc>::from);
            match self.load_value(&name).await {
                Ok(Some(value)) => listing.documents.push(StoredDocument {
                    name,
                    updated_at,
                    value,
                }),
                Ok(None) => {}
                Err(err) => listing.failed.push(DocumentFailure {
                    name,
                    error: err.to_string(),
                }),
            }
        }

        listing.documents.sort_by(|a, b| a.name.cmp(&b.name));
        listing.failed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Returns whether a file was removed.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

async fn atomic_write(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content)
        .await
        .map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}
