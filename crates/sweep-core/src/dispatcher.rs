use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sweep_observability::RunEvent;
use sweep_types::{
    Configuration, DelayBounds, ExecutionMode, RunStatus, StatusEvent, WorkItem, DECRYPT_ERROR,
    RUN_FAILED, RUN_FINISHED, RUN_STARTED,
};
use tracing::Level;

use crate::config::PacingConfig;
use crate::error::{ConfigError, DispatchError};
use crate::event_bus::EventBus;
use crate::handler::{ActionHandler, ActionSpec, HandlerRegistry, RunContext};
use crate::run_log::RunLogKind;
use crate::run_state::{generate_state_name, RunState, RunStateStore};
use crate::secrets::SecretVault;
use crate::tasks::{TaskLabels, TaskRegistry};

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Pause after an item-level failure.
    pub failure_penalty: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            failure_penalty: Duration::from_secs(5),
        }
    }
}

impl TryFrom<&PacingConfig> for Pacing {
    type Error = ConfigError;

    fn try_from(value: &PacingConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            failure_penalty: value.failure_penalty()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub state_name: String,
    pub status: RunStatus,
    pub successes: usize,
    pub fails: usize,
    /// Items already in `successes` when the run started.
    pub skipped: usize,
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum CursorStep {
    Next { item: WorkItem, is_last: bool },
    Cancelled,
    Exhausted,
}

/// Walks the pending items of an isolated run. Cancellation is only looked
/// at between items.
pub(crate) struct ItemCursor {
    pending: VecDeque<WorkItem>,
}

impl ItemCursor {
    pub(crate) fn new(items: Vec<WorkItem>) -> Self {
        Self {
            pending: items.into(),
        }
    }

    pub(crate) fn advance(&mut self, cancelled: bool) -> CursorStep {
        if self.pending.is_empty() {
            return CursorStep::Exhausted;
        }
        if cancelled {
            return CursorStep::Cancelled;
        }
        match self.pending.pop_front() {
            Some(item) => CursorStep::Next {
                is_last: self.pending.is_empty(),
                item,
            },
            None => CursorStep::Exhausted,
        }
    }
}

pub(crate) fn jittered_delay<R: Rng + ?Sized>(bounds: DelayBounds, rng: &mut R) -> Duration {
    let min = bounds.min_secs.max(0.0);
    let max = bounds.max_secs.max(min);
    let secs = if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    };
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn next_delay(bounds: DelayBounds) -> Duration {
    jittered_delay(bounds, &mut rand::thread_rng())
}

fn shuffle_items(items: &mut [WorkItem]) {
    items.shuffle(&mut rand::thread_rng());
}

enum RunEnd {
    Completed,
    Cancelled,
}

/// Unregisters the run when dropped, so a panicking handler cannot leave
/// its run id blocked.
struct Registration<'a> {
    tasks: &'a TaskRegistry,
    run_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.tasks.unregister(self.run_id);
    }
}

/// Routes a frozen configuration to its handler and drives the run from
/// registration to its terminal status.
#[derive(Clone)]
pub struct RunDispatcher {
    handlers: HandlerRegistry,
    states: Arc<RunStateStore>,
    tasks: TaskRegistry,
    event_bus: EventBus,
    secrets: SecretVault,
    pacing: Pacing,
}

impl RunDispatcher {
    pub fn new(
        handlers: HandlerRegistry,
        states: Arc<RunStateStore>,
        tasks: TaskRegistry,
        event_bus: EventBus,
        secrets: SecretVault,
    ) -> Self {
        Self {
            handlers,
            states,
            tasks,
            event_bus,
            secrets,
            pacing: Pacing::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn states(&self) -> &Arc<RunStateStore> {
        &self.states
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Checks that the configuration names a registered action with sane
    /// pacing. Touches nothing.
    pub fn validate(&self, config: &Configuration) -> Result<ActionSpec, DispatchError> {
        let launch = &config.launch_params;
        let (_, spec) = self.handlers.resolve(&launch.group, &launch.action)?;
        check_delay(launch.delay)?;
        Ok(spec)
    }

    pub async fn dispatch(
        &self,
        config: Configuration,
        items: Vec<WorkItem>,
    ) -> Result<RunOutcome, DispatchError> {
        let run_id = config
            .state_name()
            .map(str::to_string)
            .unwrap_or_else(generate_state_name);

        let (handler, spec) = match self.preflight(&config, &items) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.report_failure(Some(&run_id), &config, &err);
                return Err(err);
            }
        };

        let labels = TaskLabels {
            group: config.launch_params.group.clone(),
            action: config.launch_params.action.clone(),
            mode: spec.mode,
        };
        let task = match self.tasks.register(&run_id, labels) {
            Ok(task) => task,
            Err(err) => {
                let err = DispatchError::from(err);
                self.report_failure(Some(&run_id), &config, &err);
                return Err(err);
            }
        };
        let registration = Registration {
            tasks: &self.tasks,
            run_id: &run_id,
        };

        self.event_bus.publish(StatusEvent::new(
            RUN_STARTED,
            json!({
                "runId": run_id,
                "group": config.launch_params.group,
                "action": config.launch_params.action,
                "mode": spec.mode,
                "items": items.len(),
            }),
        ));
        RunEvent::new("run.started", "dispatcher")
            .run(run_id.as_str())
            .action(&config.launch_params.group, &config.launch_params.action)
            .emit(Level::INFO);

        let config = Arc::new(config);
        let ctx = RunContext::new(
            config.clone(),
            self.states.clone(),
            self.tasks.clone(),
            task,
            self.secrets.clone(),
        );
        let result = self.drive(handler, spec, &config, items, &ctx).await;
        drop(registration);

        match result {
            Ok((end, skipped)) => self.finish(&run_id, end, skipped).await,
            Err(err) => {
                let info = format!("failed: {err}");
                if let Err(save_err) = self
                    .states
                    .set_status(&run_id, RunStatus::Failed, Some(info.clone()))
                    .await
                {
                    tracing::warn!(run_id = %run_id, "could not record failed status: {save_err}");
                }
                ctx.log(RunLogKind::Error, info).await;
                self.report_failure(Some(&run_id), &config, &err);
                Err(err)
            }
        }
    }

    fn preflight(
        &self,
        config: &Configuration,
        items: &[WorkItem],
    ) -> Result<(Arc<dyn ActionHandler>, ActionSpec), DispatchError> {
        let launch = &config.launch_params;
        let (handler, spec) = self.handlers.resolve(&launch.group, &launch.action)?;
        check_delay(launch.delay)?;
        if items.is_empty() {
            return Err(DispatchError::MissingConfig("no work items".to_string()));
        }
        let missing = self.secrets.missing(&handler.required_secrets(&launch.action));
        if !missing.is_empty() {
            return Err(DispatchError::Credential(format!(
                "missing secrets: {}",
                missing.join(", ")
            )));
        }
        Ok((handler, spec))
    }

    async fn drive(
        &self,
        handler: Arc<dyn ActionHandler>,
        spec: ActionSpec,
        config: &Configuration,
        items: Vec<WorkItem>,
        ctx: &RunContext,
    ) -> Result<(RunEnd, usize), DispatchError> {
        let run_id = ctx.run_id();
        let mut state = self
            .states
            .load(run_id, RunState::for_configuration(run_id, config))
            .await?;
        state.status = RunStatus::Running;
        state.info = format!(
            "running {}/{}",
            config.launch_params.group, config.launch_params.action
        );
        if state.launch_params.is_none() {
            state.launch_params = Some(config.launch_params.clone());
            state.action_function_params = Some(config.function_params.clone());
        }
        self.states.save(&state).await?;

        match spec.mode {
            ExecutionMode::Isolated => {
                let total = items.len();
                let mut pending: Vec<WorkItem> =
                    items.into_iter().filter(|i| !state.is_done(&i.id)).collect();
                let skipped = total - pending.len();
                if config.launch_params.shuffle {
                    shuffle_items(&mut pending);
                }
                ctx.log(
                    RunLogKind::Info,
                    format!("{} items pending, {skipped} already done", pending.len()),
                )
                .await;
                let end = self
                    .run_isolated(handler.as_ref(), pending, config.launch_params.delay, ctx)
                    .await?;
                Ok((end, skipped))
            }
            ExecutionMode::Joint => {
                ctx.log(RunLogKind::Info, format!("{} items handed over", items.len()))
                    .await;
                handler.execute_joint(&items, ctx).await?;
                let end = if ctx.is_cancelled() {
                    RunEnd::Cancelled
                } else {
                    RunEnd::Completed
                };
                Ok((end, 0))
            }
        }
    }

    async fn run_isolated(
        &self,
        handler: &dyn ActionHandler,
        pending: Vec<WorkItem>,
        delay: DelayBounds,
        ctx: &RunContext,
    ) -> Result<RunEnd, DispatchError> {
        let run_id = ctx.run_id();
        let mut cursor = ItemCursor::new(pending);
        loop {
            let (item, is_last) = match cursor.advance(ctx.is_cancelled()) {
                CursorStep::Next { item, is_last } => (item, is_last),
                CursorStep::Cancelled => return Ok(RunEnd::Cancelled),
                CursorStep::Exhausted => return Ok(RunEnd::Completed),
            };

            match handler.execute_isolated(&item, ctx).await {
                Ok(outcome) => {
                    self.states.mark_success(run_id, &item.id).await?;
                    ctx.log(RunLogKind::Success, format!("{}: done", item.id))
                        .await;
                    if !outcome.skip_delay && !is_last {
                        pause(next_delay(delay), ctx).await;
                    }
                }
                Err(err) if err.is_run_level() => return Err(err.into()),
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!(run_id = %run_id, item_id = %item.id, "item failed: {message}");
                    RunEvent::new("item.failed", "dispatcher")
                        .run(run_id)
                        .item(&item.id)
                        .detail(&message)
                        .emit(Level::WARN);
                    self.states.mark_fail(run_id, &item.id).await?;
                    ctx.log(RunLogKind::Error, format!("{}: {message}", item.id))
                        .await;
                    if !is_last {
                        pause(self.pacing.failure_penalty, ctx).await;
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        run_id: &str,
        end: RunEnd,
        skipped: usize,
    ) -> Result<RunOutcome, DispatchError> {
        let status = match end {
            RunEnd::Completed => RunStatus::Completed,
            RunEnd::Cancelled => RunStatus::Cancelled,
        };
        let state = self
            .states
            .update(run_id, |state| {
                state.status = status;
                state.info = format!("{}: {}", status.as_str(), state.summary());
            })
            .await?;
        let kind = match status {
            RunStatus::Cancelled => RunLogKind::Warning,
            _ => RunLogKind::Info,
        };
        if let Err(err) = self.states.log(run_id, kind, state.info.clone()).await {
            tracing::warn!(run_id = %run_id, "failed to append run log: {err}");
        }

        let outcome = RunOutcome {
            state_name: run_id.to_string(),
            status,
            successes: state.successes.len(),
            fails: state.fails.len(),
            skipped,
        };
        self.event_bus.publish(StatusEvent::new(
            RUN_FINISHED,
            json!({
                "runId": run_id,
                "status": status.as_str(),
                "successes": outcome.successes,
                "fails": outcome.fails,
            }),
        ));
        RunEvent::new("run.finished", "dispatcher")
            .run(run_id)
            .status(status.as_str())
            .emit(Level::INFO);
        Ok(outcome)
    }

    /// Publishes a rejected or failed run. Credential failures go out as
    /// `decrypt_error` so a UI can prompt for the secret.
    pub fn report_rejection(&self, config: &Configuration, err: &DispatchError) {
        self.report_failure(config.state_name(), config, err);
    }

    fn report_failure(&self, run_id: Option<&str>, config: &Configuration, err: &DispatchError) {
        let event_type = if err.is_credential() {
            DECRYPT_ERROR
        } else {
            RUN_FAILED
        };
        let message = err.to_string();
        self.event_bus.publish(StatusEvent::new(
            event_type,
            json!({
                "runId": run_id,
                "group": config.launch_params.group,
                "action": config.launch_params.action,
                "error": message,
                "code": err.code(),
            }),
        ));
        RunEvent::new("run.failed", "dispatcher")
            .run(run_id)
            .action(&config.launch_params.group, &config.launch_params.action)
            .error_code(err.code())
            .detail(&message)
            .emit(Level::ERROR);
    }
}

fn check_delay(delay: DelayBounds) -> Result<(), DispatchError> {
    if delay.is_valid() {
        return Ok(());
    }
    Err(DispatchError::MissingConfig(format!(
        "invalid delay bounds {}..{}",
        delay.min_secs, delay.max_secs
    )))
}

/// Sleeps unless the run is cancelled first.
async fn pause(duration: Duration, ctx: &RunContext) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = ctx.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, ItemOutcome};
    use crate::storage_paths::SweepPaths;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::Value;
    use sweep_types::{FunctionParams, LaunchParams};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        dispatcher: RunDispatcher,
        bus: EventBus,
    }

    fn harness(handlers: HandlerRegistry) -> Harness {
        harness_with_penalty(handlers, Duration::ZERO)
    }

    fn harness_with_penalty(handlers: HandlerRegistry, failure_penalty: Duration) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let paths = SweepPaths::from_root(temp.path());
        paths.ensure().unwrap();
        let bus = EventBus::new();
        let dispatcher = RunDispatcher::new(
            handlers,
            Arc::new(RunStateStore::new(&paths)),
            TaskRegistry::new(),
            bus.clone(),
            SecretVault::new(),
        )
        .with_pacing(Pacing { failure_penalty });
        Harness {
            _temp: temp,
            dispatcher,
            bus,
        }
    }

    fn config(group: &str, action: &str, state: &str, params: Value) -> Configuration {
        let mut launch = LaunchParams::new(group, action);
        launch.delay = DelayBounds::fixed(0.0);
        launch.state_name = Some(state.to_string());
        let params = match params {
            Value::Object(map) => FunctionParams::from(map),
            _ => FunctionParams::default(),
        };
        Configuration::new(launch, params)
    }

    fn items(ids: &[&str]) -> Vec<WorkItem> {
        ids.iter().map(|id| WorkItem::new(*id)).collect()
    }

    /// Records every item it sees and cancels its own run on `cancel_on`.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        tasks: TaskRegistry,
        cancel_on: Option<&'static str>,
        credential_on: Option<&'static str>,
    }

    #[async_trait]
    impl ActionHandler for Recorder {
        fn group(&self) -> &str {
            "test"
        }

        fn actions(&self) -> &[ActionSpec] {
            const ACTIONS: &[ActionSpec] = &[ActionSpec::isolated("record")];
            ACTIONS
        }

        async fn execute_isolated(
            &self,
            item: &WorkItem,
            ctx: &RunContext,
        ) -> Result<ItemOutcome, HandlerError> {
            self.seen.lock().push(item.id.clone());
            if self.credential_on == Some(item.id.as_str()) {
                return Err(HandlerError::Credential("key rejected".into()));
            }
            if self.cancel_on == Some(item.id.as_str()) {
                self.tasks.cancel(ctx.run_id());
            }
            Ok(ItemOutcome::done())
        }
    }

    struct Exploder;

    #[async_trait]
    impl ActionHandler for Exploder {
        fn group(&self) -> &str {
            "test"
        }

        fn actions(&self) -> &[ActionSpec] {
            const ACTIONS: &[ActionSpec] = &[ActionSpec::isolated("explode")];
            ACTIONS
        }

        async fn execute_isolated(
            &self,
            _item: &WorkItem,
            _ctx: &RunContext,
        ) -> Result<ItemOutcome, HandlerError> {
            panic!("handler bug");
        }
    }

    fn recorder_harness(
        cancel_on: Option<&'static str>,
        credential_on: Option<&'static str>,
    ) -> (Harness, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = HandlerRegistry::new();
        let h = harness(handlers.clone());
        handlers.register(Arc::new(Recorder {
            seen: seen.clone(),
            tasks: h.dispatcher.tasks().clone(),
            cancel_on,
            credential_on,
        }));
        (h, seen)
    }

    #[test]
    fn cursor_checks_cancellation_before_each_item() {
        let mut cursor = ItemCursor::new(items(&["a", "b"]));
        assert_eq!(
            cursor.advance(false),
            CursorStep::Next {
                item: WorkItem::new("a"),
                is_last: false
            }
        );
        assert_eq!(cursor.advance(true), CursorStep::Cancelled);
        assert_eq!(
            cursor.advance(false),
            CursorStep::Next {
                item: WorkItem::new("b"),
                is_last: true
            }
        );
        assert_eq!(cursor.advance(true), CursorStep::Exhausted);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let bounds = DelayBounds {
            min_secs: 1.0,
            max_secs: 2.0,
        };
        for _ in 0..100 {
            let d = jittered_delay(bounds, &mut rng);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
        assert_eq!(
            jittered_delay(DelayBounds::fixed(3.0), &mut rng),
            Duration::from_secs(3)
        );
        assert_eq!(
            jittered_delay(DelayBounds::fixed(1e30), &mut rng),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn happy_path_completes_and_publishes() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut rx = h.bus.subscribe();

        let outcome = h
            .dispatcher
            .dispatch(
                config("builtin", "probe", "happy", serde_json::json!({})),
                items(&["a", "b", "c"]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.successes, 3);
        assert_eq!(outcome.fails, 0);

        assert!(rx.recv().await.unwrap().is(RUN_STARTED));
        let finished = rx.recv().await.unwrap();
        assert!(finished.is(RUN_FINISHED));
        assert_eq!(finished.properties["status"], "completed");
        assert!(h.dispatcher.tasks().is_empty());

        let state = h.dispatcher.states().get("happy").await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.launch_params.is_some());
    }

    #[tokio::test]
    async fn item_error_is_recorded_and_run_continues() {
        let h = harness(HandlerRegistry::with_builtins());
        let outcome = h
            .dispatcher
            .dispatch(
                config(
                    "builtin",
                    "probe",
                    "partial",
                    serde_json::json!({"fail_items": ["b"]}),
                ),
                items(&["a", "b", "c"]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!((outcome.successes, outcome.fails), (2, 1));

        let state = h.dispatcher.states().get("partial").await.unwrap().unwrap();
        assert!(state.fails.contains("b"));
        assert!(state.successes.contains("c"));
        let log = h
            .dispatcher
            .states()
            .tail_log("partial", 100)
            .await
            .unwrap();
        assert!(log.entries.iter().any(|e| e.kind == RunLogKind::Error));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_item() {
        let (h, seen) = recorder_harness(Some("b"), None);
        let outcome = h
            .dispatcher
            .dispatch(
                config("test", "record", "cancelled", Value::Null),
                items(&["a", "b", "c"]),
            )
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);

        let state = h.dispatcher.states().get("cancelled").await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(state.info.contains("successes: 2"));
        assert!(!state.successes.contains("c"));
    }

    #[tokio::test]
    async fn run_level_error_aborts_without_marking_the_item() {
        let (h, seen) = recorder_harness(None, Some("b"));
        let mut rx = h.bus.subscribe();
        let err = h
            .dispatcher
            .dispatch(
                config("test", "record", "aborted", Value::Null),
                items(&["a", "b", "c"]),
            )
            .await
            .unwrap_err();
        assert!(err.is_credential());
        assert_eq!(seen.lock().len(), 2);

        let state = h.dispatcher.states().get("aborted").await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(!state.fails.contains("b"));
        assert!(!state.successes.contains("b"));

        assert!(rx.recv().await.unwrap().is(RUN_STARTED));
        assert!(rx.recv().await.unwrap().is(DECRYPT_ERROR));
    }

    #[tokio::test]
    async fn unsupported_action_fails_fast() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut rx = h.bus.subscribe();
        let err = h
            .dispatcher
            .dispatch(
                config("builtin", "teleport", "nope", Value::Null),
                items(&["a"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedAction { .. }));
        assert!(rx.recv().await.unwrap().is(RUN_FAILED));
        assert!(!h.dispatcher.states().exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn joint_mode_routes_bookkeeping_through_context() {
        let h = harness(HandlerRegistry::with_builtins());
        let outcome = h
            .dispatcher
            .dispatch(
                config(
                    "builtin",
                    "fanout",
                    "joint",
                    serde_json::json!({"fail_items": ["y"], "source": "test"}),
                ),
                items(&["x", "y", "z"]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!((outcome.successes, outcome.fails), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_wakes_early_when_cancelled() {
        let registry = TaskRegistry::new();
        let task = registry
            .register(
                "r",
                TaskLabels {
                    group: "g".into(),
                    action: "a".into(),
                    mode: ExecutionMode::Isolated,
                },
            )
            .unwrap();
        let temp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(
            Arc::new(config("g", "a", "r", Value::Null)),
            Arc::new(RunStateStore::new(&SweepPaths::from_root(temp.path()))),
            registry.clone(),
            task,
            SecretVault::new(),
        );

        let started = tokio::time::Instant::now();
        let canceller = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                registry.cancel("r");
            })
        };
        pause(Duration::from_secs(60), &ctx).await;
        canceller.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    async fn timed_dispatch(h: &Harness, config: Configuration, ids: &[&str]) -> Duration {
        let started = tokio::time::Instant::now();
        h.dispatcher.dispatch(config, items(ids)).await.unwrap();
        started.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_separates_items_but_not_after_the_last() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut cfg = config("builtin", "probe", "paced", serde_json::json!({}));
        cfg.launch_params.delay = DelayBounds::fixed(2.0);

        let elapsed = timed_dispatch(&h, cfg, &["a", "b", "c"]).await;
        assert!(elapsed >= Duration::from_secs(4), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn skip_delay_outcome_suppresses_the_pause() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut cfg = config(
            "builtin",
            "probe",
            "eager",
            serde_json::json!({"skip_delay": true}),
        );
        cfg.launch_params.delay = DelayBounds::fixed(30.0);

        let elapsed = timed_dispatch(&h, cfg, &["a", "b", "c"]).await;
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_penalty_applies_except_after_the_last_item() {
        let h = harness_with_penalty(HandlerRegistry::with_builtins(), Duration::from_secs(7));
        let cfg = config(
            "builtin",
            "probe",
            "penalised",
            serde_json::json!({"fail_items": ["a", "c"]}),
        );

        let elapsed = timed_dispatch(&h, cfg, &["a", "b", "c"]).await;
        assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_pauses_stay_within_bounds() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut cfg = config("builtin", "probe", "jitter", serde_json::json!({}));
        cfg.launch_params.delay = DelayBounds {
            min_secs: 1.0,
            max_secs: 3.0,
        };

        let elapsed = timed_dispatch(&h, cfg, &["a", "b", "c"]).await;
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(6), "{elapsed:?}");
    }

    #[tokio::test]
    async fn shuffle_visits_every_item_once_in_a_new_order() {
        let (h, seen) = recorder_harness(None, None);
        let ids: Vec<String> = (0..20).map(|i| format!("item-{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut cfg = config("test", "record", "shuffled", Value::Null);
        cfg.launch_params.shuffle = true;

        h.dispatcher.dispatch(cfg, items(&refs)).await.unwrap();

        let visited = seen.lock().clone();
        assert_ne!(visited, ids);
        let mut sorted = visited;
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[tokio::test]
    async fn unrepresentable_delay_is_rejected_before_registration() {
        let h = harness(HandlerRegistry::with_builtins());
        let mut rx = h.bus.subscribe();
        let mut cfg = config("builtin", "probe", "huge", serde_json::json!({}));
        cfg.launch_params.delay = DelayBounds::fixed(1e30);

        let err = h.dispatcher.dispatch(cfg, items(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingConfig(_)));
        assert!(rx.recv().await.unwrap().is(RUN_FAILED));
        assert!(h.dispatcher.tasks().is_empty());
        assert!(!h.dispatcher.states().exists("huge").await.unwrap());
    }

    #[tokio::test]
    async fn panicking_handler_still_releases_its_run_id() {
        let handlers = HandlerRegistry::new();
        handlers.register(Arc::new(Exploder));
        let h = harness(handlers);

        let dispatcher = h.dispatcher.clone();
        let joined = tokio::spawn(async move {
            dispatcher
                .dispatch(config("test", "explode", "boom", Value::Null), items(&["a"]))
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert!(h.dispatcher.tasks().is_empty());
    }

    #[tokio::test]
    async fn duplicate_run_id_is_reported_and_left_registered() {
        let h = harness(HandlerRegistry::with_builtins());
        h.dispatcher
            .tasks()
            .register(
                "busy",
                TaskLabels {
                    group: "builtin".into(),
                    action: "probe".into(),
                    mode: ExecutionMode::Isolated,
                },
            )
            .unwrap();
        let mut rx = h.bus.subscribe();

        let err = h
            .dispatcher
            .dispatch(
                config("builtin", "probe", "busy", serde_json::json!({})),
                items(&["a"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyActive(_)));
        let failed = rx.recv().await.unwrap();
        assert!(failed.is(RUN_FAILED));
        assert_eq!(failed.properties["code"], "RUN_ALREADY_ACTIVE");
        assert!(h.dispatcher.tasks().is_active("busy"));
    }
}
