//! Control API for instance management.
//!
//! All paths live under `/api`. The vLLM surface hangs off `/containers`
//! and the Ollama surface mirrors it under `/ollama` (plus model routes);
//! both share the same handlers, parameterized by engine kind.
//!
//! | Method | Path                                    | Description                      |
//! |--------|-----------------------------------------|----------------------------------|
//! | GET    | `/health`                               | Liveness probe                   |
//! | GET    | `/containers`                           | List with live status            |
//! | GET    | `/containers/with-orphan-check`         | Reconcile, then list             |
//! | GET    | `/containers/orphans?autoImport=bool`   | Detect (optionally import)       |
//! | POST   | `/containers/orphans/import`            | Import a named subset            |
//! | POST   | `/containers`                           | Create                           |
//! | GET    | `/containers/{id}`                      | One record with live status      |
//! | PUT    | `/containers/{id}`                      | Replace configuration            |
//! | POST   | `/containers/{id}/start|stop|restart`   | Lifecycle                        |
//! | DELETE | `/containers/{id}`                      | Remove                           |
//! | GET    | `/containers/{id}/logs?tail=N`          | Logs as text                     |
//! | *      | `/ollama/...`                           | Mirror, plus `{id}/models` CRUD  |
//! | GET    | `/system/gpu[/available|/stats]`        | Inventory and derived view       |
//! | POST   | `/system/refresh-gpu`                   | Force rediscovery                |

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::ApiError;
use crate::gpu::GpuInventory;
use crate::manager::{CreateRequest, InstanceManager, InstanceView};
use crate::puller::ModelPuller;
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::{EngineKind, InstanceStatus, OllamaModel};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub reconciler: Arc<Reconciler>,
    pub puller: Arc<ModelPuller>,
    pub gpus: Arc<GpuInventory>,
    pub store: Arc<Store>,
}

/// Build the `/api` router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/containers", kind_router(EngineKind::Vllm))
        .nest("/ollama", ollama_router())
        .nest("/system", system_router())
        .with_state(state)
}

fn kind_router(kind: EngineKind) -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances).post(create_instance))
        .route("/with-orphan-check", get(list_with_orphan_check))
        .route("/orphans", get(detect_orphans))
        .route("/orphans/import", post(import_orphans))
        .route(
            "/{id}",
            get(get_instance).put(update_instance).delete(remove_instance),
        )
        .route("/{id}/start", post(start_instance))
        .route("/{id}/stop", post(stop_instance))
        .route("/{id}/restart", post(restart_instance))
        .route("/{id}/logs", get(instance_logs))
        .layer(Extension(kind))
}

fn ollama_router() -> Router<AppState> {
    kind_router(EngineKind::Ollama)
        .route("/{id}/models", get(list_models).post(pull_model))
        .route("/{id}/models/{name}", axum::routing::delete(delete_model))
}

fn system_router() -> Router<AppState> {
    Router::new()
        .route("/gpu", get(gpu_inventory))
        .route("/gpu/available", get(gpu_available))
        .route("/gpu/stats", get(gpu_stats))
        .route("/refresh-gpu", post(refresh_gpu))
}

// ── Response types ──────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResponse {
    id: Uuid,
    kind: EngineKind,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    port: u16,
    status: InstanceStatus,
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_id: Option<String>,
    require_auth: bool,
    config: crate::types::InstanceConfig,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<InstanceView> for InstanceResponse {
    fn from(view: InstanceView) -> Self {
        let InstanceView {
            instance,
            status,
            running,
            container_state,
        } = view;
        Self {
            id: instance.id,
            kind: instance.kind,
            name: instance.name,
            model_name: instance.model_ref,
            port: instance.port,
            status,
            running,
            container_state,
            container_id: instance.container_id,
            gpu_id: instance.gpu.to_column(),
            require_auth: instance.api_key_hash.is_some(),
            config: instance.config,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OllamaInstanceResponse {
    #[serde(flatten)]
    instance: InstanceResponse,
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrphanQuery {
    #[serde(default)]
    auto_import: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportRequest {
    container_ids: Vec<String>,
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    model_name: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn list_instances(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
) -> Result<Json<Vec<InstanceResponse>>, ApiError> {
    let views = state.manager.list(kind).await?;
    Ok(Json(views.into_iter().map(InstanceResponse::from).collect()))
}

async fn list_with_orphan_check(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = state.manager.list_with_reconcile(kind).await;
    let containers: Vec<InstanceResponse> = listing
        .views
        .into_iter()
        .map(InstanceResponse::from)
        .collect();
    Ok(Json(json!({
        "containers": containers,
        "reconcile": listing.report,
        "warning": listing.warning,
    })))
}

async fn detect_orphans(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Query(query): Query<OrphanQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.auto_import.unwrap_or(false) {
        let report = state.reconciler.reconcile(Some(kind), true).await?;
        return Ok(Json(json!({ "orphans": [], "report": report })));
    }
    let orphans = state.reconciler.detect_orphans(Some(kind)).await?;
    Ok(Json(json!({ "orphans": orphans, "report": null })))
}

async fn import_orphans(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Json(request): Json<ImportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.container_ids.is_empty() {
        return Err(ApiError::Validation(
            "containerIds must not be empty".to_string(),
        ));
    }
    let report = state
        .reconciler
        .import_selected(Some(kind), &request.container_ids)
        .await?;
    Ok(Json(report))
}

async fn create_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Json(request): Json<CreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.manager.create(kind, request).await?;
    Ok((StatusCode::CREATED, Json(InstanceResponse::from(view))))
}

async fn get_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, ApiError> {
    let view = state.manager.get(kind, id).await?;
    if kind == EngineKind::Ollama {
        let models = state
            .store
            .list_models(id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok(Json(OllamaInstanceResponse {
            instance: view.into(),
            models,
        })
        .into_response());
    }
    Ok(Json(InstanceResponse::from(view)).into_response())
}

async fn update_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let view = state.manager.update(kind, id, request).await?;
    Ok(Json(view.into()))
}

async fn remove_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.remove(kind, id).await?;
    Ok(Json(json!({ "id": id, "status": "removed" })))
}

async fn start_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.start(kind, id).await?.into()))
}

async fn stop_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.stop(kind, id).await?.into()))
}

async fn restart_instance(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.manager.restart(kind, id).await?.into()))
}

async fn instance_logs(
    State(state): State<AppState>,
    Extension(kind): Extension<EngineKind>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
    state.manager.logs(kind, id, query.tail).await
}

// ── Ollama model handlers ───────────────────────────────────────────────

async fn list_models(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<OllamaModel>>, ApiError> {
    // 404 for unknown instances, not an empty list.
    state.manager.get(EngineKind::Ollama, id).await?;
    let models = state
        .store
        .list_models(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(models))
}

/// Kick off a pull and stream progress as server-sent events. Each `data:`
/// line is one JSON progress record; the stream closes on completion or
/// error. Disconnecting does not abort the transfer.
async fn pull_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PullRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let view = state.manager.get(EngineKind::Ollama, id).await?;
    let rx = state.puller.pull(&view.instance, &request.model_name).await?;

    let stream = ReceiverStream::new(rx).map(|progress| {
        let data =
            serde_json::to_string(&progress).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn delete_model(
    State(state): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.manager.get(EngineKind::Ollama, id).await?;
    state.puller.delete_model(&view.instance, &name).await?;
    Ok(Json(json!({ "model": name, "status": "deleted" })))
}

// ── System handlers ─────────────────────────────────────────────────────

async fn gpu_inventory(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gpus.devices().await)
}

async fn gpu_available(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.gpus.devices().await;
    Json(json!({
        "available": !devices.is_empty(),
        "count": devices.len(),
    }))
}

async fn gpu_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let devices = state.gpus.devices().await;
    let usage = state
        .store
        .gpu_usage()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "devices": devices,
        "runningInstances": usage,
    })))
}

async fn refresh_gpu(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gpus.refresh().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let config = crate::Config {
            port: 1,
            db_path: ":memory:".to_string(),
            docker_command: "mock-docker-not-on-path".to_string(),
            nvidia_smi_command: "mock-nvidia-smi-not-on-path".to_string(),
            auto_import: false,
            ..crate::Config::default()
        };
        let (app, _state) = crate::build_app(config).await.unwrap();
        app
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn create_without_model_name_is_bad_request() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/containers")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"name":"x","requireAuth":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/containers/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_import_list_is_rejected() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/containers/orphans/import")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"containerIds":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn create_request_rejects_missing_name() {
        // Serde-level shape check: name is required.
        let result: Result<CreateRequest, _> =
            serde_json::from_str(r#"{"modelName": "org/m"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn orphan_query_parses_auto_import() {
        let q: OrphanQuery = serde_json::from_str(r#"{"autoImport": true}"#).unwrap();
        assert_eq!(q.auto_import, Some(true));
    }
}
