use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweep_types::{Configuration, FunctionParams, LaunchParams, RunStatus};

use crate::document_store::{DocumentFailure, DocumentListing, DocumentStore};
use crate::error::{StateError, StoreError};
use crate::run_log::{RunLogEntry, RunLogKind, RunLogStore, RunLogTail};
use crate::storage_paths::SweepPaths;

/// Persisted progress of one run. `successes` and `fails` never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    #[serde(skip)]
    pub id: String,
    pub successes: BTreeSet<String>,
    pub fails: BTreeSet<String>,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_params: Option<LaunchParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_function_params: Option<FunctionParams>,
}

impl RunState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn for_configuration(id: impl Into<String>, config: &Configuration) -> Self {
        Self {
            launch_params: Some(config.launch_params.clone()),
            action_function_params: Some(config.function_params.clone()),
            ..Self::new(id)
        }
    }

    pub fn mark_success(&mut self, item_id: &str) {
        self.fails.remove(item_id);
        self.successes.insert(item_id.to_string());
    }

    pub fn mark_fail(&mut self, item_id: &str) {
        self.successes.remove(item_id);
        self.fails.insert(item_id.to_string());
    }

    pub fn is_done(&self, item_id: &str) -> bool {
        self.successes.contains(item_id)
    }

    pub fn summary(&self) -> String {
        format!(
            "successes: {}, fails: {}",
            self.successes.len(),
            self.fails.len()
        )
    }
}

/// Checks the raw document before it is trusted as a `RunState`.
pub fn validate_schema(name: &str, value: &Value) -> Result<RunState, StateError> {
    let invalid = |reason: String| StateError::InvalidSchema {
        name: name.to_string(),
        reason,
    };
    let Some(object) = value.as_object() else {
        return Err(invalid("document is not an object".to_string()));
    };

    let mut sets = Vec::with_capacity(2);
    for field in ["successes", "fails"] {
        let Some(array) = object.get(field).and_then(Value::as_array) else {
            return Err(invalid(format!("`{field}` must be an array")));
        };
        let mut set = BTreeSet::new();
        for entry in array {
            let Some(id) = entry.as_str() else {
                return Err(invalid(format!("`{field}` must contain only strings")));
            };
            set.insert(id);
        }
        sets.push(set);
    }
    if let Some(shared) = sets[0].intersection(&sets[1]).next() {
        return Err(invalid(format!(
            "item `{shared}` is in both `successes` and `fails`"
        )));
    }

    let mut state: RunState =
        serde_json::from_value(value.clone()).map_err(|err| invalid(err.to_string()))?;
    state.id = name.to_string();
    Ok(state)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub file_name: String,
    pub deleted: bool,
    pub log_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeleteResult {
    pub fn refused(file_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            deleted: false,
            log_deleted: false,
            error: Some(error.into()),
        }
    }
}

/// Run documents under `states/`, addressed by id. Every mutation re-reads
/// the document, applies the change and saves it.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    documents: DocumentStore,
    logs: RunLogStore,
}

impl RunStateStore {
    pub fn new(paths: &SweepPaths) -> Self {
        Self {
            documents: DocumentStore::new(&paths.states_dir),
            logs: RunLogStore::new(&paths.state_logs_dir),
        }
    }

    pub fn logs(&self) -> &RunLogStore {
        &self.logs
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StateError> {
        Ok(self.documents.exists(id).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<RunState>, StateError> {
        match self.documents.load_value(id).await? {
            Some(value) => validate_schema(id, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Get-or-create. An existing document is validated and returned without
    /// being rewritten.
    pub async fn load(&self, id: &str, defaults: RunState) -> Result<RunState, StateError> {
        let mut state = defaults;
        state.id = id.to_string();
        let seed = serde_json::to_value(&state).map_err(StoreError::from)?;
        let value = self.documents.get_or_create(id, seed).await?;
        validate_schema(id, &value)
    }

    pub async fn save(&self, state: &RunState) -> Result<(), StateError> {
        Ok(self.documents.save(&state.id, state).await?)
    }

    pub async fn update<F>(&self, id: &str, f: F) -> Result<RunState, StateError>
    where
        F: FnOnce(&mut RunState),
    {
        let mut state = self
            .get(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        f(&mut state);
        self.save(&state).await?;
        Ok(state)
    }

    pub async fn mark_success(&self, id: &str, item_id: &str) -> Result<RunState, StateError> {
        self.update(id, |state| state.mark_success(item_id)).await
    }

    pub async fn mark_fail(&self, id: &str, item_id: &str) -> Result<RunState, StateError> {
        self.update(id, |state| state.mark_fail(item_id)).await
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: RunStatus,
        info: Option<String>,
    ) -> Result<RunState, StateError> {
        self.update(id, |state| {
            state.status = status;
            if let Some(info) = info {
                state.info = info;
            }
        })
        .await
    }

    pub async fn log(
        &self,
        id: &str,
        kind: RunLogKind,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.logs.append(id, &RunLogEntry::now(kind, message)).await
    }

    pub async fn tail_log(&self, id: &str, max_lines: usize) -> Result<RunLogTail, StoreError> {
        self.logs.tail(id, max_lines).await
    }

    /// All documents; ones that fail schema validation are reported in
    /// `failed` instead.
    pub async fn list(&self) -> Result<DocumentListing, StateError> {
        let mut listing = self.documents.list().await?;
        let mut valid = Vec::with_capacity(listing.documents.len());
        for doc in listing.documents.drain(..) {
            match validate_schema(&doc.name, &doc.value) {
                Ok(_) => valid.push(doc),
                Err(err) => listing.failed.push(DocumentFailure {
                    name: doc.name,
                    error: err.to_string(),
                }),
            }
        }
        listing.documents = valid;
        listing.failed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Removes each document and its log. Never fails as a whole.
    pub async fn delete(&self, names: &[String]) -> Vec<DeleteResult> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let deleted = self.documents.delete(name).await;
            let log_deleted = self.logs.delete(name).await;
            let error = match (&deleted, &log_deleted) {
                (Err(err), _) | (_, Err(err)) => Some(err.to_string()),
                (Ok(false), Ok(false)) => Some("not found".to_string()),
                _ => None,
            };
            results.push(DeleteResult {
                file_name: name.clone(),
                deleted: deleted.unwrap_or(false),
                log_deleted: log_deleted.unwrap_or(false),
                error,
            });
        }
        results
    }
}

pub fn generate_state_name() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S-%3f"))
}
