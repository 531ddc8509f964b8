use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sweep_types::{Configuration, ExecutionMode, FunctionParams, LaunchParams, WorkItem};
use thiserror::Error;

use crate::builtin::BuiltinHandler;
use crate::error::{DispatchError, StateError};
use crate::run_log::RunLogKind;
use crate::run_state::RunStateStore;
use crate::secrets::SecretVault;
use crate::tasks::{TaskHandle, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionSpec {
    pub name: &'static str,
    pub mode: ExecutionMode,
}

impl ActionSpec {
    pub const fn isolated(name: &'static str) -> Self {
        Self {
            name,
            mode: ExecutionMode::Isolated,
        }
    }

    pub const fn joint(name: &'static str) -> Self {
        Self {
            name,
            mode: ExecutionMode::Joint,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Go straight to the next item without the inter-item pause.
    pub skip_delay: bool,
}

impl ItemOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn without_delay() -> Self {
        Self { skip_delay: true }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Only this item failed; the run continues.
    #[error("{0}")]
    Item(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("action `{group}/{action}` is not supported")]
    UnsupportedAction { group: String, action: String },
    #[error(transparent)]
    Storage(#[from] StateError),
}

impl HandlerError {
    pub fn item(message: impl Into<String>) -> Self {
        HandlerError::Item(message.into())
    }

    pub fn is_run_level(&self) -> bool {
        !matches!(self, HandlerError::Item(_))
    }
}

/// What a handler sees of the run it is executing in. Progress is recorded
/// by run id, so handlers keep no run state of their own.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    config: Arc<Configuration>,
    states: Arc<RunStateStore>,
    tasks: TaskRegistry,
    task: TaskHandle,
    secrets: SecretVault,
}

impl RunContext {
    pub(crate) fn new(
        config: Arc<Configuration>,
        states: Arc<RunStateStore>,
        tasks: TaskRegistry,
        task: TaskHandle,
        secrets: SecretVault,
    ) -> Self {
        Self {
            run_id: task.run_id().to_string(),
            config,
            states,
            tasks,
            task,
            secrets,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn group(&self) -> &str {
        &self.config.launch_params.group
    }

    pub fn action(&self) -> &str {
        &self.config.launch_params.action
    }

    pub fn launch_params(&self) -> &LaunchParams {
        &self.config.launch_params
    }

    pub fn function_params(&self) -> &FunctionParams {
        &self.config.function_params
    }

    /// Parses the action arguments into the handler's own type.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        self.config.function_params.parse().map_err(|err| {
            HandlerError::MissingConfig(format!(
                "invalid function params for {}/{}: {err}",
                self.group(),
                self.action()
            ))
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tasks.is_cancelled(&self.run_id)
    }

    pub async fn cancelled(&self) {
        self.task.cancelled().await
    }

    pub fn secret(&self, name: &str) -> Result<String, HandlerError> {
        self.secrets
            .get(name)
            .ok_or_else(|| HandlerError::Credential(format!("secret `{name}` is not available")))
    }

    pub async fn record_success(&self, item_id: &str) -> Result<(), HandlerError> {
        self.states.mark_success(&self.run_id, item_id).await?;
        self.log(RunLogKind::Success, format!("{item_id}: done")).await;
        Ok(())
    }

    pub async fn record_fail(&self, item_id: &str, reason: &str) -> Result<(), HandlerError> {
        self.states.mark_fail(&self.run_id, item_id).await?;
        self.log(RunLogKind::Error, format!("{item_id}: {reason}"))
            .await;
        Ok(())
    }

    /// Best effort; a log write failure never fails the run.
    pub async fn log(&self, kind: RunLogKind, message: impl Into<String>) {
        if let Err(err) = self.states.log(&self.run_id, kind, message).await {
            tracing::warn!(run_id = %self.run_id, "failed to append run log: {err}");
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn group(&self) -> &str;

    fn actions(&self) -> &[ActionSpec];

    fn required_secrets(&self, _action: &str) -> Vec<String> {
        Vec::new()
    }

    fn action_spec(&self, action: &str) -> Option<ActionSpec> {
        self.actions().iter().find(|spec| spec.name == action).copied()
    }

    async fn execute_isolated(
        &self,
        _item: &WorkItem,
        ctx: &RunContext,
    ) -> Result<ItemOutcome, HandlerError> {
        Err(HandlerError::UnsupportedAction {
            group: ctx.group().to_string(),
            action: ctx.action().to_string(),
        })
    }

    async fn execute_joint(&self, _items: &[WorkItem], ctx: &RunContext) -> Result<(), HandlerError> {
        Err(HandlerError::UnsupportedAction {
            group: ctx.group().to_string(),
            action: ctx.action().to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerSummary {
    pub group: String,
    pub actions: Vec<ActionSpec>,
}

/// Handlers keyed by action group.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(BuiltinHandler));
        registry
    }

    /// Replaces any handler already registered for the same group.
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        self.handlers
            .write()
            .insert(handler.group().to_string(), handler);
    }

    pub fn resolve(
        &self,
        group: &str,
        action: &str,
    ) -> Result<(Arc<dyn ActionHandler>, ActionSpec), DispatchError> {
        let unsupported = || DispatchError::UnsupportedAction {
            group: group.to_string(),
            action: action.to_string(),
        };
        let handler = self.handlers.read().get(group).cloned().ok_or_else(unsupported)?;
        let spec = handler.action_spec(action).ok_or_else(unsupported)?;
        Ok((handler, spec))
    }

    pub fn list(&self) -> Vec<HandlerSummary> {
        let mut out: Vec<HandlerSummary> = self
            .handlers
            .read()
            .values()
            .map(|h| HandlerSummary {
                group: h.group().to_string(),
                actions: h.actions().to_vec(),
            })
            .collect();
        out.sort_by(|a, b| a.group.cmp(&b.group));
        out
    }
}
