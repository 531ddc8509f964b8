use std::path::{Path, PathBuf};

use serde_json::json;
use sweep_types::{ChosenBy, Configuration, RunStatus, StatusEvent, SELECTION_CHANGED};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::arbiter::SelectionArbiter;
use crate::config::ConfigStore;
use crate::dispatcher::{RunDispatcher, RunOutcome};
use crate::error::DispatchError;
use crate::event_bus::EventBus;
use crate::run_state::generate_state_name;
use crate::work_items::load_work_items;

/// The wait-for-choice / dispatch / reset loop shared by every surface.
#[derive(Clone)]
pub struct RunService {
    config: ConfigStore,
    arbiter: SelectionArbiter,
    dispatcher: RunDispatcher,
    event_bus: EventBus,
    items_base_dir: PathBuf,
}

impl RunService {
    pub fn new(
        config: ConfigStore,
        arbiter: SelectionArbiter,
        dispatcher: RunDispatcher,
        event_bus: EventBus,
    ) -> Self {
        let items_base_dir = config
            .project_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config,
            arbiter,
            dispatcher,
            event_bus,
            items_base_dir,
        }
    }

    pub fn with_items_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.items_base_dir = dir.into();
        self
    }

    pub fn arbiter(&self) -> &SelectionArbiter {
        &self.arbiter
    }

    pub fn dispatcher(&self) -> &RunDispatcher {
        &self.dispatcher
    }

    /// Resolves the configuration for `key`, names the run if it has no
    /// state name yet, and checks it can be dispatched.
    pub async fn prepare_snapshot(&self, key: Option<&str>) -> Result<Configuration, DispatchError> {
        let mut config = self.config.resolve(key).await?;
        let named = config
            .launch_params
            .state_name
            .as_deref()
            .map(|name| !name.trim().is_empty())
            .unwrap_or(false);
        if !named {
            config.launch_params.state_name = Some(generate_state_name());
        }
        self.dispatcher.validate(&config)?;
        Ok(config)
    }

    pub fn choose(&self, by: ChosenBy, snapshot: Configuration) -> bool {
        let state_name = snapshot.state_name().map(str::to_string);
        if !self.arbiter.choose(by, snapshot) {
            return false;
        }
        self.event_bus.publish(StatusEvent::new(
            SELECTION_CHANGED,
            json!({ "chosenBy": by.as_str(), "stateName": state_name }),
        ));
        true
    }

    pub fn reset(&self) {
        self.arbiter.reset();
        self.event_bus.publish(StatusEvent::new(
            SELECTION_CHANGED,
            json!({ "chosenBy": ChosenBy::None.as_str(), "stateName": null }),
        ));
    }

    /// One iteration: wait for a choice, run it, reset. The arbiter is reset
    /// whatever the outcome.
    pub async fn run_once(&self) -> Result<RunOutcome, DispatchError> {
        let by = self.arbiter.wait_for_choice().await;
        let Some(snapshot) = self.arbiter.snapshot() else {
            self.reset();
            return Err(DispatchError::MissingConfig(
                "selection has no configuration".to_string(),
            ));
        };
        tracing::info!(
            chosen_by = by.as_str(),
            state_name = snapshot.state_name().unwrap_or(""),
            "run chosen"
        );

        let result = match load_work_items(&snapshot.launch_params, &self.items_base_dir).await {
            Ok(items) => self.dispatcher.dispatch(snapshot, items).await,
            Err(err) => {
                let err = DispatchError::from(err);
                self.dispatcher.report_rejection(&snapshot, &err);
                Err(err)
            }
        };
        self.reset();
        result
    }

    /// Loops until `shutdown`. A shutdown during a run cancels it and waits
    /// for it to wind down. A panicking run fails its state and the loop
    /// carries on.
    pub async fn run_forever(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.arbiter.wait_for_choice() => {}
            }

            let watcher = {
                let tasks = self.dispatcher.tasks().clone();
                let stop = shutdown.clone();
                tokio::spawn(async move {
                    stop.cancelled().await;
                    for task in tasks.list() {
                        tasks.cancel(&task.run_id);
                    }
                })
            };
            let snapshot = self.arbiter.snapshot();
            let run = {
                let service = self.clone();
                tokio::spawn(async move { service.run_once().await })
            };
            match run.await {
                Ok(Ok(outcome)) => tracing::info!(
                    state_name = %outcome.state_name,
                    status = outcome.status.as_str(),
                    successes = outcome.successes,
                    fails = outcome.fails,
                    "run finished"
                ),
                Ok(Err(err)) => tracing::warn!(code = err.code(), "run did not complete: {err}"),
                Err(err) => self.recover_from_panic(snapshot, err).await,
            }
            watcher.abort();
        }
    }

    async fn recover_from_panic(&self, snapshot: Option<Configuration>, join_err: JoinError) {
        tracing::error!("run task aborted: {join_err}");
        if let Some(snapshot) = snapshot {
            let err = DispatchError::HandlerFailed("run panicked".to_string());
            if let Some(name) = snapshot.state_name() {
                if let Err(save_err) = self
                    .dispatcher
                    .states()
                    .set_status(name, RunStatus::Failed, Some(format!("failed: {err}")))
                    .await
                {
                    tracing::warn!(
                        state_name = name,
                        "could not record failed status: {save_err}"
                    );
                }
            }
            self.dispatcher.report_rejection(&snapshot, &err);
        }
        self.reset();
    }
}
