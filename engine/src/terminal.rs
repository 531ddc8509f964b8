use std::io::BufRead;
use std::sync::Arc;

use serde_json::Value;
use sweep_server::RuntimeState;
use sweep_types::{
    ChosenBy, StatusEvent, DECRYPT_ERROR, RUN_FAILED, RUN_FINISHED, RUN_STARTED,
    SELECTION_CHANGED,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PROMPT_HINT: &str = "press Enter to start the configured run, `s` for status, `c [name]` to cancel, `q` to quit";

#[derive(Debug, PartialEq, Eq)]
pub enum PromptCommand {
    Start,
    Status,
    Cancel(Option<String>),
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> PromptCommand {
    let trimmed = line.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    match head {
        "" => PromptCommand::Start,
        "s" | "status" => PromptCommand::Status,
        "c" | "cancel" if rest.is_empty() => PromptCommand::Cancel(None),
        "c" | "cancel" => PromptCommand::Cancel(Some(rest.to_string())),
        "q" | "quit" | "exit" => PromptCommand::Quit,
        _ => PromptCommand::Unknown(trimmed.to_string()),
    }
}

/// Stdin is read on a plain thread: a blocked read inside the runtime would
/// keep the process alive after shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Races the UI for the selection from the terminal until `q` or shutdown.
pub async fn run_prompt(
    runtime: Arc<RuntimeState>,
    preset: Option<String>,
    shutdown: CancellationToken,
) {
    let mut lines = spawn_stdin_reader();
    println!("{PROMPT_HINT}");
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            tracing::info!("stdin closed; terminal prompt disabled");
            break;
        };
        match parse_command(&line) {
            PromptCommand::Start => start_from_terminal(&runtime, preset.as_deref()).await,
            PromptCommand::Status => print_status(&runtime),
            PromptCommand::Cancel(name) => cancel_from_terminal(&runtime, name.as_deref()),
            PromptCommand::Quit => {
                shutdown.cancel();
                break;
            }
            PromptCommand::Unknown(other) => {
                println!("unknown command `{other}`; {PROMPT_HINT}")
            }
        }
    }
}

async fn start_from_terminal(runtime: &RuntimeState, preset: Option<&str>) {
    let current = runtime.arbiter.chosen_by();
    if current.is_chosen() {
        println!("a run was already chosen by {}", current.as_str());
        return;
    }
    match runtime.service.prepare_snapshot(preset).await {
        Ok(snapshot) => {
            let state_name = snapshot.state_name().unwrap_or_default().to_string();
            if runtime.service.choose(ChosenBy::Terminal, snapshot) {
                println!("starting {state_name}");
            } else {
                println!(
                    "a run was already chosen by {}",
                    runtime.arbiter.chosen_by().as_str()
                );
            }
        }
        Err(err) => println!("cannot start: {err} ({})", err.code()),
    }
}

fn print_status(runtime: &RuntimeState) {
    let state = runtime.arbiter.state();
    println!(
        "selection: {}{}",
        state.chosen_by.as_str(),
        state
            .frozen
            .as_ref()
            .and_then(|config| config.state_name())
            .map(|name| format!(" ({name})"))
            .unwrap_or_default()
    );
    let active = runtime.tasks.list();
    if active.is_empty() {
        println!("no active runs");
    }
    for task in active {
        println!(
            "{} {}/{} since {}{}",
            task.run_id,
            task.group,
            task.action,
            task.started_at.format("%H:%M:%S"),
            if task.cancel_requested {
                " (cancelling)"
            } else {
                ""
            }
        );
    }
}

fn cancel_from_terminal(runtime: &RuntimeState, name: Option<&str>) {
    let targets: Vec<String> = match name {
        Some(name) => vec![name.to_string()],
        None => runtime.tasks.list().into_iter().map(|t| t.run_id).collect(),
    };
    if targets.is_empty() {
        println!("no active runs");
    }
    for run_id in targets {
        if runtime.tasks.cancel(&run_id) {
            println!("cancelling {run_id}");
        } else {
            println!("{run_id} is not active");
        }
    }
}

/// Echoes lifecycle events to stdout until shutdown. Events already queued
/// when shutdown fires are still printed.
pub async fn echo_events(
    mut events: broadcast::Receiver<StatusEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = shutdown.cancelled() => break,
        };
        match event {
            Ok(event) => {
                if let Some(line) = describe_event(&event) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "terminal event echo lagged")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn describe_event(event: &StatusEvent) -> Option<String> {
    let props = &event.properties;
    let text = |key: &str| match props.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    };
    let line = match event.event_type.as_str() {
        RUN_STARTED => format!(
            "[run] {} started: {}/{} over {} items",
            text("runId"),
            text("group"),
            text("action"),
            text("items")
        ),
        RUN_FINISHED => format!(
            "[run] {} {}: successes {}, fails {}",
            text("runId"),
            text("status"),
            text("successes"),
            text("fails")
        ),
        RUN_FAILED => format!(
            "[run] {} failed ({}): {}",
            text("runId"),
            text("code"),
            text("error")
        ),
        DECRYPT_ERROR => format!(
            "[run] {} needs credentials: {} (set SWEEP_SECRET_<NAME> or POST /secrets)",
            text("runId"),
            text("error")
        ),
        SELECTION_CHANGED => format!("[selection] {}", text("chosenBy")),
        _ => return None,
    };
    Some(line)
}
