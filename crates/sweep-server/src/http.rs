use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sweep_core::{
    sanitize_document_name, DeleteResult, DispatchError, StateError, StoreError,
    DEFAULT_TAIL_LINES,
};
use sweep_types::{ChosenBy, StatusEvent, SERVER_CONNECTED};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

fn dispatch_error_response(err: &DispatchError) -> Response {
    let status = match err {
        DispatchError::UnsupportedAction { .. }
        | DispatchError::MissingConfig(_)
        | DispatchError::Credential(_) => StatusCode::BAD_REQUEST,
        DispatchError::AlreadyActive(_) => StatusCode::CONFLICT,
        DispatchError::HandlerFailed(_) | DispatchError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string(), err.code())
}

fn store_error_response(err: &StoreError) -> Response {
    match err {
        StoreError::InvalidName(_) => {
            error_response(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_STATE_NAME")
        }
        _ => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "STORAGE_ERROR",
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ChooseInput {
    by: ChosenBy,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StartInput {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteStatesInput {
    file_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SecretInput {
    name: String,
    value: String,
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sweep-server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/handlers", get(handlers_list))
        .route("/events", get(events))
        .route("/selection", get(selection))
        .route("/selection/choose", post(selection_choose))
        .route("/tasks/start", post(tasks_start))
        .route("/tasks/active", get(tasks_active))
        .route("/tasks/{state_name}/cancel", post(task_cancel))
        .route("/states", get(states_list))
        .route("/states/delete", post(states_delete))
        .route("/states/logs/{state_name}", get(state_logs))
        .route("/secrets", post(secrets_set))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "buildId": crate::build_id(),
        "activeRuns": state.tasks.len(),
        "eventSubscribers": state.event_bus.subscriber_count(),
        "chosenBy": state.arbiter.chosen_by(),
        "uptimeMs": state.uptime_ms(),
    }))
}

async fn handlers_list(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "handlers": state.dispatcher.handlers().list() }))
}

async fn selection(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.arbiter.state())
}

/// Resolves the configuration and races for the arbiter. 409 when a choice
/// is already standing.
async fn choose_as(state: &AppState, by: ChosenBy, key: Option<&str>) -> Response {
    if !by.is_chosen() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "`by` must be `ui` or `terminal`",
            "INVALID_CHOOSER",
        );
    }
    let current = state.arbiter.chosen_by();
    if current.is_chosen() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "chosenBy": current })),
        )
            .into_response();
    }
    let snapshot = match state.service.prepare_snapshot(key).await {
        Ok(snapshot) => snapshot,
        Err(err) => return dispatch_error_response(&err),
    };
    let state_name = snapshot.state_name().map(str::to_string);
    if !state.service.choose(by, snapshot) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "chosenBy": state.arbiter.chosen_by() })),
        )
            .into_response();
    }
    tracing::info!(
        chosen_by = by.as_str(),
        state_name = state_name.as_deref().unwrap_or(""),
        "selection made over http"
    );
    Json(json!({ "ok": true, "chosenBy": by, "stateName": state_name })).into_response()
}

async fn selection_choose(
    State(state): State<AppState>,
    Json(input): Json<ChooseInput>,
) -> Response {
    choose_as(&state, input.by, input.key.as_deref()).await
}

async fn tasks_start(State(state): State<AppState>, body: Option<Json<StartInput>>) -> Response {
    let input = body.map(|Json(input)| input).unwrap_or_default();
    choose_as(&state, ChosenBy::Ui, input.key.as_deref()).await
}

async fn tasks_active(State(state): State<AppState>) -> impl IntoResponse {
    let tasks = state.tasks.list();
    Json(json!({ "count": tasks.len(), "tasks": tasks }))
}

async fn task_cancel(State(state): State<AppState>, Path(state_name): Path<String>) -> Response {
    if state.tasks.cancel(&state_name) {
        tracing::info!(state_name = %state_name, "cancellation requested");
        return Json(json!({ "ok": true, "stateName": state_name })).into_response();
    }
    error_response(
        StatusCode::BAD_REQUEST,
        format!("run `{state_name}` is not active"),
        "RUN_NOT_ACTIVE",
    )
}

async fn states_list(State(state): State<AppState>) -> Response {
    match state.states.list().await {
        Ok(listing) => Json(listing).into_response(),
        Err(StateError::Store(err)) => store_error_response(&err),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "STATE_ERROR",
        ),
    }
}

async fn states_delete(
    State(state): State<AppState>,
    Json(input): Json<DeleteStatesInput>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(input.file_names.len());
    for file_name in input.file_names {
        let active = sanitize_document_name(&file_name)
            .map(|name| state.tasks.is_active(&name))
            .unwrap_or(false);
        if active {
            results.push(DeleteResult::refused(file_name, "run is active"));
            continue;
        }
        results.extend(state.states.delete(std::slice::from_ref(&file_name)).await);
    }
    Json(json!({ "results": results }))
}

async fn state_logs(State(state): State<AppState>, Path(state_name): Path<String>) -> Response {
    match state.states.tail_log(&state_name, DEFAULT_TAIL_LINES).await {
        Ok(tail) => Json(tail).into_response(),
        Err(err) => store_error_response(&err),
    }
}

async fn secrets_set(State(state): State<AppState>, Json(input): Json<SecretInput>) -> Response {
    if !state.secrets.set(&input.name, input.value) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "secret name and value are required",
            "INVALID_SECRET",
        );
    }
    tracing::info!(name = %input.name.trim(), "runtime secret stored");
    Json(json!({ "ok": true, "name": input.name.trim().to_ascii_lowercase() })).into_response()
}

fn sse_stream(state: AppState) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&StatusEvent::new(
            SERVER_CONNECTED,
            json!({ "timestampMs": crate::now_ms() }),
        ))
        .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use sweep_core::{ConfigStore, HandlerRegistry, SecretVault, SweepPaths, TaskLabels};
    use sweep_types::ExecutionMode;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::RuntimeState;

    async fn test_state() -> (TempDir, AppState) {
        let root = tempfile::tempdir().expect("tempdir");
        let paths = SweepPaths::from_root(root.path());
        let config = ConfigStore::new_with_global(
            &paths.config_path,
            root.path().join("global-config.json"),
            Some(json!({
                "launch_params": {
                    "group": "builtin",
                    "action": "probe",
                    "delay": { "min_secs": 0, "max_secs": 0 },
                    "items": ["a", "b"]
                },
                "presets": {
                    "broken": { "launch_params": { "action": "teleport" } }
                },
                "pacing": { "failure_penalty_secs": 0 }
            })),
        )
        .await
        .expect("config");
        let runtime = RuntimeState::build(
            paths,
            config,
            SecretVault::new(),
            HandlerRegistry::with_builtins(),
        )
        .await
        .expect("runtime");
        (root, AppState::new(runtime))
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let req = builder.body(body).expect("request");
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, payload)
    }

    #[tokio::test]
    async fn health_route_reports_active_runs() {
        let (_root, state) = test_state().await;
        let (status, payload) = call(app_router(state.clone()), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["activeRuns"], 0);
        assert_eq!(payload["chosenBy"], "none");
        assert_eq!(payload["eventSubscribers"], 0);

        let _rx = state.event_bus.subscribe();
        let (_, payload) = call(app_router(state), "GET", "/health", None).await;
        assert_eq!(payload["eventSubscribers"], 1);
    }

    #[tokio::test]
    async fn handlers_route_lists_groups_and_modes() {
        let (_root, state) = test_state().await;
        let (status, payload) = call(app_router(state), "GET", "/handlers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["handlers"][0]["group"], "builtin");
        let actions = payload["handlers"][0]["actions"].as_array().expect("actions");
        assert!(actions
            .iter()
            .any(|a| a["name"] == "probe" && a["mode"] == "isolated"));
        assert!(actions
            .iter()
            .any(|a| a["name"] == "fanout" && a["mode"] == "joint"));
    }

    #[tokio::test]
    async fn second_choice_conflicts_with_the_first() {
        let (_root, state) = test_state().await;
        let app = app_router(state.clone());

        let (status, first) = call(
            app.clone(),
            "POST",
            "/selection/choose",
            Some(json!({"by": "terminal"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["chosenBy"], "terminal");
        assert!(first["stateName"].as_str().is_some());

        let (status, second) = call(app.clone(), "POST", "/tasks/start", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(second["ok"], false);
        assert_eq!(second["chosenBy"], "terminal");

        let (_, selection) = call(app, "GET", "/selection", None).await;
        assert_eq!(selection["chosenBy"], "terminal");
        assert_eq!(selection["frozen"]["launch_params"]["action"], "probe");
    }

    #[tokio::test]
    async fn start_rejects_unresolvable_configuration() {
        let (_root, state) = test_state().await;
        let app = app_router(state.clone());

        let (status, payload) = call(
            app.clone(),
            "POST",
            "/tasks/start",
            Some(json!({"key": "broken"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "UNSUPPORTED_ACTION");

        let (status, payload) =
            call(app, "POST", "/tasks/start", Some(json!({"key": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "MISSING_CONFIG");
        assert_eq!(state.arbiter.chosen_by(), ChosenBy::None);
    }

    #[tokio::test]
    async fn choosing_none_is_a_bad_request() {
        let (_root, state) = test_state().await;
        let (status, payload) = call(
            app_router(state),
            "POST",
            "/selection/choose",
            Some(json!({"by": "none"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_CHOOSER");
    }

    #[tokio::test]
    async fn cancel_distinguishes_active_runs() {
        let (_root, state) = test_state().await;
        let app = app_router(state.clone());

        let (status, payload) = call(app.clone(), "POST", "/tasks/ghost/cancel", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "RUN_NOT_ACTIVE");

        let handle = state
            .tasks
            .register(
                "live",
                TaskLabels {
                    group: "builtin".into(),
                    action: "probe".into(),
                    mode: ExecutionMode::Isolated,
                },
            )
            .expect("register");
        let (status, payload) = call(app.clone(), "POST", "/tasks/live/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["ok"], true);
        assert!(handle.is_cancelled());

        let (_, active) = call(app, "GET", "/tasks/active", None).await;
        assert_eq!(active["count"], 1);
        assert_eq!(active["tasks"][0]["runId"], "live");
        assert_eq!(active["tasks"][0]["cancelRequested"], true);
        assert_eq!(active["tasks"][0]["mode"], "isolated");
    }

    #[tokio::test]
    async fn finished_runs_are_listed_logged_and_deletable() {
        let (_root, state) = test_state().await;
        let snapshot = state.service.prepare_snapshot(None).await.expect("snapshot");
        let name = snapshot.state_name().expect("name").to_string();
        assert!(state.service.choose(ChosenBy::Ui, snapshot));
        state.service.run_once().await.expect("run");

        let app = app_router(state.clone());
        let (status, listing) = call(app.clone(), "GET", "/states", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["states"][0]["name"], name.as_str());
        assert_eq!(listing["states"][0]["data"]["status"], 2);
        assert_eq!(listing["failed"], json!([]));

        let (status, logs) = call(app.clone(), "GET", &format!("/states/logs/{name}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(logs["entries"].as_array().map(|e| !e.is_empty()).unwrap_or(false));
        assert_eq!(logs["failedCount"], 0);

        let (status, deleted) = call(
            app.clone(),
            "POST",
            "/states/delete",
            Some(json!({"fileNames": [format!("{name}.json")]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["results"][0]["deleted"], true);
        assert_eq!(deleted["results"][0]["logDeleted"], true);

        let (_, listing) = call(app, "GET", "/states", None).await;
        assert_eq!(listing["states"], json!([]));
    }

    #[tokio::test]
    async fn delete_refuses_active_runs() {
        let (_root, state) = test_state().await;
        let _handle = state
            .tasks
            .register(
                "busy",
                TaskLabels {
                    group: "builtin".into(),
                    action: "probe".into(),
                    mode: ExecutionMode::Isolated,
                },
            )
            .expect("register");
        let (_, payload) = call(
            app_router(state),
            "POST",
            "/states/delete",
            Some(json!({"fileNames": ["busy.json"]})),
        )
        .await;
        assert_eq!(payload["results"][0]["deleted"], false);
        assert_eq!(payload["results"][0]["error"], "run is active");
    }

    #[tokio::test]
    async fn log_route_rejects_path_traversal() {
        let (_root, state) = test_state().await;
        let (status, payload) = call(
            app_router(state),
            "GET",
            "/states/logs/..%2Fsecrets",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_STATE_NAME");
    }

    #[tokio::test]
    async fn secrets_route_stores_runtime_secret() {
        let (_root, state) = test_state().await;
        let app = app_router(state.clone());
        let (status, payload) = call(
            app.clone(),
            "POST",
            "/secrets",
            Some(json!({"name": "Signer_Key", "value": "s3cret"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["name"], "signer_key");
        assert_eq!(state.secrets.get("signer_key").as_deref(), Some("s3cret"));

        let (status, _) = call(
            app,
            "POST",
            "/secrets",
            Some(json!({"name": " ", "value": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_route_opens_an_sse_stream() {
        let (_root, state) = test_state().await;
        let req = Request::builder()
            .method("GET")
            .uri("/events")
            .body(Body::empty())
            .expect("request");
        let resp = app_router(state).oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        assert!(content_type.starts_with("text/event-stream"));
    }
}
