/**
 * API REST FLEETWATCH - Surface opérateur du kernel
 *
 * RÔLE :
 * Expose la flotte consolidée (lecture des snapshots du moteur), la vue détail
 * et les commandes opérateur. Les commandes passent par le dispatcher, jamais
 * par le registre : l'état affiché ne change qu'au retour du canal push.
 *
 * FONCTIONNEMENT :
 * - Routes : /health, /system/health, /terminals, /detail
 * - Vues terminal enrichies de stale / stale_for_seconds
 * - Erreurs : terminal inconnu => 404, validation => 400, store => 502
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Clé absente côté serveur => tout est refusé
 */

use crate::commands::{CommandDispatcher, CommandError, PowerAction};
use crate::detail::DetailSnapshot;
use crate::engine::{EngineError, EngineHandle};
use crate::health::{FleetHealth, HealthTracker};
use crate::heartbeat::{self, HeartbeatIn};
use crate::models::{Metrics, NewTerminal, Terminal, TerminalId, TerminalRecord, TerminalStatus};
use crate::store::{CanonicalStore, StoreError};
use crate::sweeper::Sweeper;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub commands: Arc<CommandDispatcher>,
    pub store: Arc<dyn CanonicalStore>,
    pub health_tracker: HealthTracker,
    pub sweeper: Sweeper,
    /// Vide => API fermée
    pub api_key: Arc<str>,
}

#[derive(Serialize)]
struct TerminalView {
    #[serde(flatten)]
    terminal: Terminal,
    stale: bool,
    stale_for_seconds: i64,
}

fn to_view(terminal: &Terminal, sweeper: &Sweeper, now: OffsetDateTime) -> TerminalView {
    TerminalView {
        terminal: terminal.clone(),
        stale: sweeper.is_stale(terminal, now),
        stale_for_seconds: (now - terminal.last_heartbeat).whole_seconds().max(0),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        let status = match &err {
            CommandError::UnknownTerminal(_) => StatusCode::NOT_FOUND,
            CommandError::Validation(_) => StatusCode::BAD_REQUEST,
            CommandError::Store(_) => StatusCode::BAD_GATEWAY,
        };
        Self { status, message: err.to_string() }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        CommandError::from(err).into()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::UnknownTerminal(_) => StatusCode::NOT_FOUND,
            EngineError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self { status, message: err.to_string() }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if app.api_key.is_empty() {
        warn!("FLEETWATCH_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == &*app.api_key);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/terminals", get(list_terminals).post(add_terminal))
        .route("/terminals/{id}", get(get_terminal).delete(delete_terminal))
        .route("/terminals/{id}/action", post(send_action))
        .route("/terminals/{id}/rename", post(rename))
        .route("/terminals/{id}/snapshot", post(force_snapshot))
        .route("/terminals/{id}/heartbeat", post(post_heartbeat))
        .route("/detail", get(get_detail).delete(close_detail))
        .route("/detail/{id}", put(open_detail))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<FleetHealth> {
    Json(app.health_tracker.get_health(&app.engine))
}

// GET /terminals (liste consolidée, triée par id)
async fn list_terminals(State(app): State<AppState>) -> Json<Vec<TerminalView>> {
    let now = OffsetDateTime::now_utc();
    let snapshot = app.engine.snapshot();
    Json(snapshot.terminals.iter().map(|t| to_view(t, &app.sweeper, now)).collect())
}

// GET /terminals/{id}
async fn get_terminal(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
) -> Result<Json<TerminalView>, StatusCode> {
    let snapshot = app.engine.snapshot();
    let terminal = snapshot.terminal(id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_view(terminal, &app.sweeper, OffsetDateTime::now_utc())))
}

// POST /terminals
async fn add_terminal(
    State(app): State<AppState>,
    Json(new): Json<NewTerminal>,
) -> Result<(StatusCode, Json<TerminalRecord>), ApiError> {
    let record = app.commands.add_terminal(new).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// DELETE /terminals/{id}
async fn delete_terminal(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.commands.delete_terminal(id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    action: String,
}

// POST /terminals/{id}/action {"action": "reboot" | "shutdown" | "maintenance"}
async fn send_action(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
    Json(body): Json<ActionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action: PowerAction = body.action.parse()?;
    app.commands.send_action(id, action).await?;
    Ok(Json(json!({ "status": "written", "action": action })))
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

// POST /terminals/{id}/rename
async fn rename(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
    Json(body): Json<RenameBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.commands.rename(id, &body.name).await?;
    Ok(Json(json!({ "status": "written" })))
}

// POST /terminals/{id}/snapshot
async fn force_snapshot(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let nonce = app.commands.force_snapshot(id).await?;
    Ok(Json(json!({ "status": "written", "refresh_trigger": nonce })))
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    #[serde(default, deserialize_with = "crate::models::lenient_status")]
    status: Option<TerminalStatus>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    screenshot_url: Option<String>,
}

// POST /terminals/{id}/heartbeat (agents sans MQTT)
async fn post_heartbeat(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
    Json(body): Json<HeartbeatBody>,
) -> Result<StatusCode, ApiError> {
    let hb = HeartbeatIn {
        terminal_id: id,
        status: body.status,
        ip_address: body.ip_address,
        metrics: body.metrics,
        screenshot_url: body.screenshot_url,
        last_seen: None,
    };
    heartbeat::ingest_heartbeat(app.store.as_ref(), &hb, OffsetDateTime::now_utc()).await?;
    Ok(StatusCode::ACCEPTED)
}

// GET /detail (null si aucune vue ouverte)
async fn get_detail(State(app): State<AppState>) -> Json<Option<DetailSnapshot>> {
    Json(app.engine.snapshot().detail.clone())
}

// PUT /detail/{id}
async fn open_detail(
    State(app): State<AppState>,
    Path(id): Path<TerminalId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.engine.open_detail(id).await?;
    Ok(Json(json!({ "status": "opened", "terminal_id": id })))
}

// DELETE /detail
async fn close_detail(State(app): State<AppState>) -> Result<StatusCode, ApiError> {
    app.engine.close_detail().await?;
    Ok(StatusCode::NO_CONTENT)
}
