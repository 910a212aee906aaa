/**
 * API REST FLUID - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose l'orchestrateur en REST et accepte les connexions WebSocket des hôtes.
 *
 * FONCTIONNEMENT :
 * - /health et /v1/hosts/connect hors middleware (les hôtes s'authentifient
 *   par token Bearer dans le stream handler)
 * - Toutes les autres routes exigent le header x-api-key (FLUID_API_KEY)
 * - Routes métier scoping par org : /v1/orgs/{org_id}/...
 * - OrchestratorError -> 404 / 503 / 504 / 502 / 400 / 409 / 500
 */

use crate::correlator::SharedCorrelator;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Command, HostInfo, Sandbox, SnapshotInfo, SourceCommandOutput, SourceFile, VmInfo};
use crate::orchestrator::{CreateSandboxRequest, OrchestratorError, RunCommandRequest, SharedOrchestrator};
use crate::registry::SharedHostRegistry;
use crate::stream::{bearer_token, StreamHandler};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fluid_protocol::{SourceVmPrepared, SourceVmValidation, CONNECT_PATH};
use serde::Deserialize;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SharedOrchestrator,
    pub stream: StreamHandler,
    pub registry: SharedHostRegistry,
    pub correlator: SharedCorrelator,
    pub health_tracker: HealthTracker,
    pub api_key: String,
}

pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::HostUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::ExecutionFailed(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidState(_) => StatusCode::CONFLICT,
        OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check et connexion des hôtes toujours accessibles
    if path.starts_with("/health") || path == CONNECT_PATH {
        return Ok(next.run(req).await);
    }

    if app.api_key.is_empty() {
        warn!("[http] SECURITY: FLUID_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == app.api_key)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route(CONNECT_PATH, get(connect_host))
        .route("/v1/orgs/{org_id}/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route("/v1/orgs/{org_id}/sandboxes/{id}", get(get_sandbox).delete(destroy_sandbox))
        .route("/v1/orgs/{org_id}/sandboxes/{id}/run", post(run_command))
        .route("/v1/orgs/{org_id}/sandboxes/{id}/commands", get(list_commands))
        .route("/v1/orgs/{org_id}/sandboxes/{id}/start", post(start_sandbox))
        .route("/v1/orgs/{org_id}/sandboxes/{id}/stop", post(stop_sandbox))
        .route("/v1/orgs/{org_id}/sandboxes/{id}/snapshot", post(create_snapshot))
        .route("/v1/orgs/{org_id}/hosts", get(list_hosts))
        .route("/v1/orgs/{org_id}/hosts/{host_id}", get(get_host))
        .route("/v1/orgs/{org_id}/vms", get(list_vms))
        .route("/v1/orgs/{org_id}/vms/{name}/prepare", post(prepare_source_vm))
        .route("/v1/orgs/{org_id}/vms/{name}/validate", post(validate_source_vm))
        .route("/v1/orgs/{org_id}/vms/{name}/run", post(run_source_command))
        .route("/v1/orgs/{org_id}/vms/{name}/read", post(read_source_file))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.registry, &app.correlator))
}

// GET /v1/hosts/connect (WebSocket agent)
async fn connect_host(State(app): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let token = bearer_token(&headers).unwrap_or_default();
    let handler = app.stream.clone();
    ws.on_upgrade(move |socket| handler.handle_socket(socket, token))
}

// ============ SANDBOXES ============

async fn list_sandboxes(State(app): State<AppState>, Path(org_id): Path<String>) -> ApiResult<Vec<Sandbox>> {
    Ok(Json(app.orchestrator.list_sandboxes(&org_id)?))
}

async fn create_sandbox(
    State(app): State<AppState>,
    Path(org_id): Path<String>,
    Json(mut req): Json<CreateSandboxRequest>,
) -> Result<(StatusCode, Json<Sandbox>), ApiError> {
    req.org_id = org_id;
    let sandbox = app.orchestrator.create_sandbox(req).await?;
    Ok((StatusCode::CREATED, Json(sandbox)))
}

async fn get_sandbox(State(app): State<AppState>, Path((org_id, id)): Path<(String, String)>) -> ApiResult<Sandbox> {
    Ok(Json(app.orchestrator.get_sandbox(&org_id, &id)?))
}

async fn destroy_sandbox(
    State(app): State<AppState>,
    Path((org_id, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    app.orchestrator.destroy_sandbox(&org_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_command(
    State(app): State<AppState>,
    Path((org_id, id)): Path<(String, String)>,
    Json(req): Json<RunCommandRequest>,
) -> ApiResult<Command> {
    Ok(Json(app.orchestrator.run_command(&org_id, &id, req).await?))
}

async fn list_commands(
    State(app): State<AppState>,
    Path((org_id, id)): Path<(String, String)>,
) -> ApiResult<Vec<Command>> {
    Ok(Json(app.orchestrator.list_commands(&org_id, &id)?))
}

async fn start_sandbox(State(app): State<AppState>, Path((org_id, id)): Path<(String, String)>) -> ApiResult<Sandbox> {
    Ok(Json(app.orchestrator.start_sandbox(&org_id, &id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopBody {
    force: bool,
}

async fn stop_sandbox(
    State(app): State<AppState>,
    Path((org_id, id)): Path<(String, String)>,
    body: Option<Json<StopBody>>,
) -> ApiResult<Sandbox> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    Ok(Json(app.orchestrator.stop_sandbox(&org_id, &id, force).await?))
}

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    name: String,
}

async fn create_snapshot(
    State(app): State<AppState>,
    Path((org_id, id)): Path<(String, String)>,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<SnapshotInfo> {
    Ok(Json(app.orchestrator.create_snapshot(&org_id, &id, &body.name).await?))
}

// ============ HÔTES ============

async fn list_hosts(State(app): State<AppState>, Path(org_id): Path<String>) -> Json<Vec<HostInfo>> {
    Json(app.orchestrator.list_hosts(&org_id))
}

async fn get_host(
    State(app): State<AppState>,
    Path((org_id, host_id)): Path<(String, String)>,
) -> ApiResult<HostInfo> {
    Ok(Json(app.orchestrator.get_host(&host_id, &org_id)?))
}

// ============ VMS SOURCE ============

async fn list_vms(State(app): State<AppState>, Path(org_id): Path<String>) -> Json<Vec<VmInfo>> {
    Json(app.orchestrator.list_vms(&org_id).await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrepareBody {
    ssh_user: String,
    ssh_key_path: String,
}

async fn prepare_source_vm(
    State(app): State<AppState>,
    Path((org_id, name)): Path<(String, String)>,
    Json(body): Json<PrepareBody>,
) -> ApiResult<SourceVmPrepared> {
    Ok(Json(
        app.orchestrator
            .prepare_source_vm(&org_id, &name, &body.ssh_user, &body.ssh_key_path)
            .await?,
    ))
}

async fn validate_source_vm(
    State(app): State<AppState>,
    Path((org_id, name)): Path<(String, String)>,
) -> ApiResult<SourceVmValidation> {
    Ok(Json(app.orchestrator.validate_source_vm(&org_id, &name).await?))
}

#[derive(Debug, Deserialize)]
struct SourceCommandBody {
    command: String,
    #[serde(default)]
    timeout_seconds: u64,
}

async fn run_source_command(
    State(app): State<AppState>,
    Path((org_id, name)): Path<(String, String)>,
    Json(body): Json<SourceCommandBody>,
) -> ApiResult<SourceCommandOutput> {
    Ok(Json(
        app.orchestrator
            .run_source_command(&org_id, &name, &body.command, body.timeout_seconds)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ReadFileBody {
    path: String,
}

async fn read_source_file(
    State(app): State<AppState>,
    Path((org_id, name)): Path<(String, String)>,
    Json(body): Json<ReadFileBody>,
) -> ApiResult<SourceFile> {
    Ok(Json(app.orchestrator.read_source_file(&org_id, &name, &body.path).await?))
}
