mod terminal;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use sweep_core::{
    resolve_state_root, ConfigStore, DispatchError, HandlerRegistry, RunStateStore,
    SecretVault, StoredDocument, SweepPaths, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
    DEFAULT_TAIL_LINES,
};
use sweep_observability::{init_process_logging, ProcessKind, RunEvent};
use sweep_server::{serve, AppState, RuntimeState};
use sweep_types::{ChosenBy, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "sweep-engine")]
#[command(about = "Resumable batch runs over work items, started from a terminal or a remote UI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP control surface and race the terminal prompt against it.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Preset used when the run is started from the terminal.
        #[arg(long)]
        preset: Option<String>,
        #[arg(long, default_value_t = false)]
        no_prompt: bool,
        #[command(flatten)]
        launch: LaunchOverrides,
    },
    /// Run the configured action once from this terminal and exit.
    Run {
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        preset: Option<String>,
        #[command(flatten)]
        launch: LaunchOverrides,
    },
    /// Inspect persisted runs without starting the engine.
    States {
        #[arg(long)]
        state_dir: Option<String>,
        #[command(subcommand)]
        command: StatesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum StatesCommand {
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    Logs {
        name: String,
        #[arg(long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
    },
}

/// Launch parameters given on the command line. They form the highest
/// configuration layer.
#[derive(Args, Debug, Default, Clone)]
struct LaunchOverrides {
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    action: Option<String>,
    /// Reusing the name of an existing run resumes it.
    #[arg(long)]
    state_name: Option<String>,
    #[arg(long = "item")]
    items: Vec<String>,
    #[arg(long)]
    items_file: Option<String>,
    #[arg(long, default_value_t = false)]
    shuffle: bool,
    #[arg(long)]
    delay_min_secs: Option<f64>,
    #[arg(long)]
    delay_max_secs: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            preset,
            no_prompt,
            launch,
        } => {
            let paths = SweepPaths::from_root(resolve_state_root(state_dir.as_deref()));
            let logging =
                init_process_logging(ProcessKind::Engine, &paths.logs_dir, LOG_RETENTION_DAYS)?;
            RunEvent::new("logging.initialized", "engine.main")
                .status("ok")
                .detail("engine jsonl logging initialized")
                .emit(tracing::Level::INFO);
            info!("engine logging initialized: {:?}", logging);
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let runtime = build_runtime(
                paths,
                config.map(PathBuf::from),
                build_cli_overrides(&launch),
            )
            .await?;
            log_startup_paths(&runtime, &addr);
            let state = AppState::new(runtime);
            let shutdown = CancellationToken::new();
            spawn_interrupt_handler(shutdown.clone(), None);

            let run_loop = {
                let service = state.service.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { service.run_forever(shutdown).await })
            };
            tokio::spawn(terminal::echo_events(
                state.event_bus.subscribe(),
                shutdown.clone(),
            ));
            if !no_prompt {
                tokio::spawn(terminal::run_prompt(
                    state.runtime.clone(),
                    preset,
                    shutdown.clone(),
                ));
            }

            let served = serve(addr, state, shutdown.clone()).await;
            shutdown.cancel();
            if let Err(err) = run_loop.await {
                tracing::error!("run loop ended abnormally: {err}");
            }
            served?;
        }
        Command::Run {
            state_dir,
            config,
            preset,
            launch,
        } => {
            let paths = SweepPaths::from_root(resolve_state_root(state_dir.as_deref()));
            let _logging =
                init_process_logging(ProcessKind::Cli, &paths.logs_dir, LOG_RETENTION_DAYS)?;
            let runtime = Arc::new(
                build_runtime(
                    paths,
                    config.map(PathBuf::from),
                    build_cli_overrides(&launch),
                )
                .await?,
            );
            let snapshot = runtime
                .service
                .prepare_snapshot(preset.as_deref())
                .await
                .map_err(describe_dispatch_error)?;
            runtime.service.choose(ChosenBy::Terminal, snapshot);

            let echo_stop = CancellationToken::new();
            let echo = tokio::spawn(terminal::echo_events(
                runtime.event_bus.subscribe(),
                echo_stop.clone(),
            ));
            spawn_interrupt_handler(CancellationToken::new(), Some(runtime.clone()));

            let result = runtime.service.run_once().await;
            echo_stop.cancel();
            let _ = echo.await;
            let outcome = result.map_err(describe_dispatch_error)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::States { state_dir, command } => {
            let paths = SweepPaths::from_root(resolve_state_root(state_dir.as_deref()));
            let store = RunStateStore::new(&paths);
            match command {
                StatesCommand::List { json } => {
                    let listing = store.list().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&listing)?);
                    } else {
                        if listing.documents.is_empty() && listing.failed.is_empty() {
                            println!("no runs under {}", paths.states_dir.display());
                        }
                        for document in &listing.documents {
                            println!("{}", summarize_document(document));
                        }
                        for failure in &listing.failed {
                            eprintln!("{}: unreadable: {}", failure.name, failure.error);
                        }
                    }
                }
                StatesCommand::Delete { names } => {
                    let results = store.delete(&names).await;
                    println!("{}", serde_json::to_string_pretty(&results)?);
                }
                StatesCommand::Logs { name, lines } => {
                    let tail = store.tail_log(&name, lines).await?;
                    for entry in &tail.entries {
                        println!(
                            "{} {:<7} {}",
                            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            entry.kind.as_str(),
                            entry.message
                        );
                    }
                    if tail.failed_count > 0 {
                        eprintln!("{} log lines could not be parsed", tail.failed_count);
                    }
                }
            }
        }
    }

    Ok(())
}

fn build_cli_overrides(launch: &LaunchOverrides) -> Option<Value> {
    let mut params = Map::new();
    if let Some(group) = &launch.group {
        params.insert("group".to_string(), Value::String(group.clone()));
    }
    if let Some(action) = &launch.action {
        params.insert("action".to_string(), Value::String(action.clone()));
    }
    if let Some(name) = &launch.state_name {
        params.insert("state_name".to_string(), Value::String(name.clone()));
    }
    if !launch.items.is_empty() {
        params.insert(
            "items".to_string(),
            Value::Array(launch.items.iter().cloned().map(Value::String).collect()),
        );
    }
    if let Some(path) = &launch.items_file {
        params.insert("items_file".to_string(), Value::String(path.clone()));
    }
    if launch.shuffle {
        params.insert("shuffle".to_string(), Value::Bool(true));
    }
    let mut delay = Map::new();
    if let Some(min) = launch.delay_min_secs {
        delay.insert("min_secs".to_string(), Value::from(min));
    }
    if let Some(max) = launch.delay_max_secs {
        delay.insert("max_secs".to_string(), Value::from(max));
    }
    if !delay.is_empty() {
        params.insert("delay".to_string(), Value::Object(delay));
    }

    if params.is_empty() {
        return None;
    }
    let mut root = Map::new();
    root.insert("launch_params".to_string(), Value::Object(params));
    Some(Value::Object(root))
}

async fn build_runtime(
    paths: SweepPaths,
    config_path: Option<PathBuf>,
    cli_overrides: Option<Value>,
) -> anyhow::Result<RuntimeState> {
    let config_path = config_path.unwrap_or_else(|| paths.config_path.clone());
    let config = ConfigStore::new(&config_path, cli_overrides)
        .await
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let secrets = SecretVault::from_env();
    info!(secrets = ?secrets.names(), "runtime secrets loaded");
    RuntimeState::build(paths, config, secrets, HandlerRegistry::with_builtins()).await
}

/// Ctrl-C cancels `shutdown` and, when given, every run active in `runtime`.
fn spawn_interrupt_handler(shutdown: CancellationToken, runtime: Option<Arc<RuntimeState>>) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for interrupts: {err}");
            return;
        }
        info!("interrupt received; shutting down");
        if let Some(runtime) = runtime {
            for task in runtime.tasks.list() {
                runtime.tasks.cancel(&task.run_id);
            }
        }
        shutdown.cancel();
    });
}

fn describe_dispatch_error(err: DispatchError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(code)
}

fn summarize_document(document: &StoredDocument) -> String {
    let count = |key: &str| {
        document
            .value
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    };
    let status = document
        .value
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|raw| u8::try_from(raw).ok())
        .and_then(|raw| RunStatus::try_from(raw).ok())
        .unwrap_or_default();
    let updated = document
        .updated_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<32} {:<10} successes {:>5}  fails {:>5}  updated {}",
        document.name,
        status.as_str(),
        count("successes"),
        count("fails"),
        updated
    )
}

fn log_startup_paths(runtime: &RuntimeState, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting sweep-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={} global_config={}",
        exe.display(),
        cwd.display(),
        runtime.paths.root.display(),
        runtime.config.project_path().display(),
        runtime.config.global_path().display()
    );
}
