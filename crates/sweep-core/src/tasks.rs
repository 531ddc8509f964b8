use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sweep_types::ExecutionMode;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

#[derive(Debug, Clone)]
pub struct TaskLabels {
    pub group: String,
    pub action: String,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub group: String,
    pub action: String,
    pub mode: ExecutionMode,
}

struct TaskEntry {
    started_at: DateTime<Utc>,
    labels: TaskLabels,
    token: CancellationToken,
}

/// Handed to the run that registered; lets it observe cancellation.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    run_id: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Runs currently in flight. Locks are never held across an await.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str, labels: TaskLabels) -> Result<TaskHandle, TaskError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(run_id) {
            return Err(TaskError::AlreadyActive(run_id.to_string()));
        }
        let token = CancellationToken::new();
        tasks.insert(
            run_id.to_string(),
            TaskEntry {
                started_at: Utc::now(),
                labels,
                token: token.clone(),
            },
        );
        Ok(TaskHandle {
            run_id: run_id.to_string(),
            token,
        })
    }

    /// False when the run is unknown or already finished.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tasks.read().get(run_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.tasks
            .read()
            .get(run_id)
            .map(|entry| entry.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.tasks.read().contains_key(run_id)
    }

    pub fn unregister(&self, run_id: &str) {
        self.tasks.write().remove(run_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ActiveTask> {
        let mut out: Vec<ActiveTask> = self
            .tasks
            .read()
            .iter()
            .map(|(run_id, entry)| ActiveTask {
                run_id: run_id.clone(),
                started_at: entry.started_at,
                cancel_requested: entry.token.is_cancelled(),
                group: entry.labels.group.clone(),
                action: entry.labels.action.clone(),
                mode: entry.labels.mode,
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}
