use std::ops::Deref;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sweep_core::{
    ConfigStore, EventBus, HandlerRegistry, Pacing, RunDispatcher, RunService, RunStateStore,
    SecretVault, SelectionArbiter, SweepPaths, TaskRegistry,
};

mod http;

pub use http::{app_router, serve};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("SWEEP_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}

/// Every long-lived service of one engine process. Built once at startup
/// and shared by the HTTP surface, the terminal prompt and the run loop.
#[derive(Clone)]
pub struct RuntimeState {
    pub paths: SweepPaths,
    pub config: ConfigStore,
    pub event_bus: EventBus,
    pub arbiter: SelectionArbiter,
    pub tasks: TaskRegistry,
    pub states: Arc<RunStateStore>,
    pub secrets: SecretVault,
    pub dispatcher: RunDispatcher,
    pub service: RunService,
}

impl RuntimeState {
    pub async fn build(
        paths: SweepPaths,
        config: ConfigStore,
        secrets: SecretVault,
        handlers: HandlerRegistry,
    ) -> anyhow::Result<Self> {
        paths.ensure()?;
        let pacing = Pacing::try_from(&config.get().await?.pacing)?;
        let event_bus = EventBus::new();
        let arbiter = SelectionArbiter::new();
        let tasks = TaskRegistry::new();
        let states = Arc::new(RunStateStore::new(&paths));
        let dispatcher = RunDispatcher::new(
            handlers,
            states.clone(),
            tasks.clone(),
            event_bus.clone(),
            secrets.clone(),
        )
        .with_pacing(pacing);
        let service = RunService::new(
            config.clone(),
            arbiter.clone(),
            dispatcher.clone(),
            event_bus.clone(),
        );
        Ok(Self {
            paths,
            config,
            event_bus,
            arbiter,
            tasks,
            states,
            secrets,
            dispatcher,
            service,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeState>,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(runtime: RuntimeState) -> Self {
        Self {
            runtime: Arc::new(runtime),
            started_at_ms: now_ms(),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }
}

impl Deref for AppState {
    type Target = RuntimeState;

    fn deref(&self) -> &Self::Target {
        &self.runtime
    }
}
