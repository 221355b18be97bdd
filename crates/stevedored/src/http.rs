//! HTTP control channel and Server-Sent Events push stream.

use std::convert::Infallible;
use std::future::{Future, ready};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stevedore::{ApiResponse, ControlPlane, InstallRequest, MonitorNotice, UninstallRequest};
use stevedore_common::StevedoreError;
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;

/// Routes served by the daemon.
pub fn router(control: ControlPlane) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(connection_status))
        .route("/resources", get(list_resources))
        .route("/resources/{id}", get(get_resource))
        .route("/resources/{id}/state", get(runtime_state))
        .route("/resources/{id}/config", get(get_config).put(update_config))
        .route("/resources/{id}/install", post(install))
        .route("/resources/{id}/uninstall", post(uninstall))
        .route("/resources/{id}/start", post(start))
        .route("/resources/{id}/stop", post(stop))
        .route("/resources/{id}/restart", post(restart))
        .route("/projects", post(register_project))
        .route("/projects/{id}", delete(remove_project))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// Serve `control` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the listener's I/O error.
pub async fn serve<F>(listener: TcpListener, control: ControlPlane, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Control channel listening");
    }
    axum::serve(listener, router(control))
        .with_graceful_shutdown(shutdown)
        .await
}

fn status_code(code: Option<&str>) -> StatusCode {
    match code {
        None => StatusCode::OK,
        Some("NOT_FOUND") => StatusCode::NOT_FOUND,
        Some("VALIDATION_ERROR") => StatusCode::BAD_REQUEST,
        Some("ALREADY_INSTALLED" | "NOT_INSTALLED" | "OPERATION_IN_PROGRESS") => StatusCode::CONFLICT,
        Some("PERMISSION_DENIED") => StatusCode::FORBIDDEN,
        Some("RUNTIME_UNAVAILABLE") => StatusCode::SERVICE_UNAVAILABLE,
        Some("HEALTH_CHECK_TIMEOUT") => StatusCode::GATEWAY_TIMEOUT,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(response: ApiResponse<T>) -> Response {
    (status_code(response.code()), Json(response)).into_response()
}

fn bad_body(err: &serde_json::Error) -> Response {
    reply(ApiResponse::<()>::err(&StevedoreError::validation(format!(
        "invalid request body: {err}"
    ))))
}

/// An empty body means "use the defaults".
fn optional_body<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map(Some).map_err(|e| bad_body(&e))
}

fn required_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| bad_body(&e))
}

async fn health(State(control): State<ControlPlane>) -> Json<Value> {
    let connected = control.connection_status().data.is_some_and(|s| s.connected);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "runtime": control.engine().runtime().name(),
        "connected": connected,
    }))
}

async fn connection_status(State(control): State<ControlPlane>) -> Response {
    reply(control.connection_status())
}

async fn list_resources(State(control): State<ControlPlane>) -> Response {
    reply(control.list_resources().await)
}

async fn get_resource(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.get_resource(&id).await)
}

async fn runtime_state(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.get_runtime_state(&id).await)
}

async fn get_config(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.get_config(&id))
}

async fn update_config(
    State(control): State<ControlPlane>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    match required_body(&body) {
        Ok(config) => reply(control.update_config(&id, config)),
        Err(rejection) => rejection,
    }
}

async fn install(State(control): State<ControlPlane>, Path(id): Path<String>, body: Bytes) -> Response {
    match optional_body::<InstallRequest>(&body) {
        Ok(request) => reply(control.install(&id, request).await),
        Err(rejection) => rejection,
    }
}

async fn uninstall(State(control): State<ControlPlane>, Path(id): Path<String>, body: Bytes) -> Response {
    match optional_body::<UninstallRequest>(&body) {
        Ok(request) => reply(control.uninstall(&id, request.map(|r| r.remove_volumes)).await),
        Err(rejection) => rejection,
    }
}

async fn start(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.start(&id).await)
}

async fn stop(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.stop(&id).await)
}

async fn restart(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.restart(&id).await)
}

async fn register_project(State(control): State<ControlPlane>, body: Bytes) -> Response {
    match required_body(&body) {
        Ok(project) => reply(control.register_project(project)),
        Err(rejection) => rejection,
    }
}

async fn remove_project(State(control): State<ControlPlane>, Path(id): Path<String>) -> Response {
    reply(control.remove_project(&id).await)
}

fn sse_event<T: Serialize>(name: &'static str, payload: &T) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(event = name, error = %e, "Could not encode push event");
            None
        }
    }
}

/// Install progress and monitor notices, one SSE event each.
///
/// Event names: `progress`, `container`, `status`, `resync`.
async fn events(State(control): State<ControlPlane>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let progress = BroadcastStream::new(control.progress()).filter_map(|update| {
        ready(match update {
            Ok(progress) => sse_event("progress", &progress),
            Err(e) => {
                tracing::debug!(error = %e, "Push client lagging behind install progress");
                None
            }
        })
    });
    let notices = control.subscribe().filter_map(|notice| {
        let name = match &notice {
            MonitorNotice::Event(_) => "container",
            MonitorNotice::Status(_) => "status",
            MonitorNotice::Resync => "resync",
        };
        ready(sse_event(name, &notice))
    });

    tracing::debug!("Push client connected");
    Sse::new(stream::select(progress, notices).map(Ok)).keep_alive(KeepAlive::default())
}
