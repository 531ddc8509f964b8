use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sweep_types::{LaunchParams, WorkItem};

use crate::error::ConfigError;

/// Inline items first, then the items file. Duplicate ids keep their first
/// position. An empty result is an error.
pub async fn load_work_items(
    launch: &LaunchParams,
    base_dir: &Path,
) -> Result<Vec<WorkItem>, ConfigError> {
    let mut items: Vec<WorkItem> = launch
        .items
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(WorkItem::new)
        .collect();

    if let Some(file) = launch.items_file.as_deref().filter(|f| !f.trim().is_empty()) {
        let path = resolve_items_path(file.trim(), base_dir);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| ConfigError::ItemsFile {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        items.extend(parse_items(&raw).map_err(|reason| ConfigError::ItemsFile { path, reason })?);
    }

    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.id.clone()));
    if items.is_empty() {
        return Err(ConfigError::NoWorkItems);
    }
    Ok(items)
}

fn resolve_items_path(file: &str, base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(file);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// A JSON array of ids or of objects with an `id`, otherwise one id per
/// line. Blank lines and `#` comments are skipped.
pub fn parse_items(raw: &str) -> Result<Vec<WorkItem>, String> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> =
            serde_json::from_str(trimmed).map_err(|err| format!("invalid JSON array: {err}"))?;
        return values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| match &value {
                Value::String(id) if !id.trim().is_empty() => Ok(WorkItem::new(id.trim())),
                Value::Object(map) => match map.get("id").and_then(Value::as_str) {
                    Some(id) if !id.trim().is_empty() => {
                        Ok(WorkItem::with_data(id.trim(), value.clone()))
                    }
                    _ => Err(format!("entry {idx} has no string `id`")),
                },
                _ => Err(format!("entry {idx} is neither an id nor an object")),
            })
            .collect();
    }

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkItem::new)
        .collect())
}
