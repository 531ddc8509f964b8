use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a persisted run. Stored on disk as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl From<RunStatus> for u8 {
    fn from(value: RunStatus) -> Self {
        match value {
            RunStatus::Idle => 0,
            RunStatus::Running => 1,
            RunStatus::Completed => 2,
            RunStatus::Cancelled => 3,
            RunStatus::Failed => 4,
        }
    }
}

impl TryFrom<u8> for RunStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RunStatus::Idle),
            1 => Ok(RunStatus::Running),
            2 => Ok(RunStatus::Completed),
            3 => Ok(RunStatus::Cancelled),
            4 => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other}")),
        }
    }
}

/// One unit of work. Only `id` is used for bookkeeping; `data` is handed to
/// the handler untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}
