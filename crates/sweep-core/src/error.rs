use std::path::PathBuf;

use thiserror::Error;

use crate::handler::HandlerError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid document name `{0}`")]
    InvalidName(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run state `{name}` has an invalid schema: {reason}")]
    InvalidSchema { name: String, reason: String },
    #[error("run state `{0}` not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no action configured (group and action are required)")]
    MissingAction,
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    #[error("invalid delay bounds: min={min}s max={max}s")]
    InvalidDelay { min: f64, max: f64 },
    #[error("invalid failure penalty: {0}s")]
    InvalidPenalty(f64),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no work items to process")]
    NoWorkItems,
    #[error("failed to read items file {path:?}: {reason}")]
    ItemsFile { path: PathBuf, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("run `{0}` is already active")]
    AlreadyActive(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler supports action `{group}/{action}`")]
    UnsupportedAction { group: String, action: String },
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("run `{0}` is already active")]
    AlreadyActive(String),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error(transparent)]
    State(#[from] StateError),
}

impl DispatchError {
    /// Stable machine-readable code, shared by logs and the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnsupportedAction { .. } => "UNSUPPORTED_ACTION",
            DispatchError::MissingConfig(_) => "MISSING_CONFIG",
            DispatchError::Credential(_) => "CREDENTIAL_ERROR",
            DispatchError::AlreadyActive(_) => "RUN_ALREADY_ACTIVE",
            DispatchError::HandlerFailed(_) => "HANDLER_FAILED",
            DispatchError::State(StateError::InvalidSchema { .. }) => "STATE_INVALID_SCHEMA",
            DispatchError::State(_) => "STATE_ERROR",
        }
    }

    pub fn is_credential(&self) -> bool {
        matches!(self, DispatchError::Credential(_))
    }
}

impl From<HandlerError> for DispatchError {
    fn from(value: HandlerError) -> Self {
        match value {
            HandlerError::Credential(msg) => DispatchError::Credential(msg),
            HandlerError::MissingConfig(msg) => DispatchError::MissingConfig(msg),
            HandlerError::UnsupportedAction { group, action } => {
                DispatchError::UnsupportedAction { group, action }
            }
            HandlerError::Item(msg) => DispatchError::HandlerFailed(msg),
            HandlerError::Storage(err) => DispatchError::State(err),
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(value: ConfigError) -> Self {
        DispatchError::MissingConfig(value.to_string())
    }
}

impl From<TaskError> for DispatchError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::AlreadyActive(id) => DispatchError::AlreadyActive(id),
        }
    }
}
