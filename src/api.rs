//! HTTP and WebSocket surface.
//!
//! Every route that acts for someone requires the `x-api-key` header; the
//! token view, nonce routes and metrics are open.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::auth::NonceAuthority;
use crate::control::{ClientMessage, ControlChannel, ControlEvent, Subscription};
use crate::error::PipelineError;
use crate::ingest::{NewTokenEvent, TokenIngestor};
use crate::launch::{LaunchCoordinator, LaunchOutcome, LaunchRequest};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::registry::{ActiveUserRegistry, ActivityStatus};
use crate::storage::Store;
use crate::types::{now_naive, to_millis, EnrichedToken, NewToken, ScoredRecommendation};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub ingestor: Arc<TokenIngestor>,
    pub registry: Arc<ActiveUserRegistry>,
    pub auth: Arc<NonceAuthority>,
    pub launches: Arc<LaunchCoordinator>,
    pub control: ControlChannel,
    pub metrics: PipelineMetrics,
    pub api_key: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/tokens", post(ingest_token))
        .route("/v1/tokens/:mint", get(token_view))
        .route("/v1/users/active", post(bulk_activity))
        .route("/v1/users/:wallet/active", get(activity))
        .route("/v1/users/:wallet/heartbeat", post(heartbeat))
        .route("/v1/auth/nonce", post(issue_nonce))
        .route("/v1/auth/verify", post(verify_nonce))
        .route("/v1/launches", post(launch))
        .route("/v1/ws/:wallet", get(control_socket))
        .route("/v1/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(state: ApiState, listen: String, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", listen))?;
    info!("HTTP API listening on {}", listen);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(PipelineError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
            PipelineError::BundleRejected(_) | PipelineError::PartialFill { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::BundleNotLanded { .. } | PipelineError::EnrichmentTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            PipelineError::ExitFailedManual { .. } => StatusCode::CONFLICT,
            PipelineError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            warn!("Request failed: {:#}", self.0);
        }
        let body = json!({
            "error": self.0.reason_code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require_api_key(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state.api_key.trim();
    if expected.is_empty() {
        return Err(PipelineError::auth("api key not configured").into());
    }
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(provided) if keys_match(provided.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(PipelineError::auth("invalid api key").into()),
        None => Err(PipelineError::auth("missing x-api-key header").into()),
    }
}

/// Constant-time in the key contents; only the length can short-circuit.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

async fn ingest_token(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<StatusBody> {
    require_api_key(&state, &headers)?;
    let event: NewTokenEvent = serde_json::from_value(body)
        .map_err(|e| PipelineError::validation(format!("malformed new-token event: {}", e)))?;
    let outcome = state.ingestor.ingest(event).await?;
    Ok(Json(StatusBody {
        status: match outcome {
            crate::ingest::IngestOutcome::Inserted => "inserted",
            crate::ingest::IngestOutcome::Skipped => "skipped",
        },
    }))
}

/// Everything known about one mint.
#[derive(Debug, Serialize)]
pub struct TokenView {
    pub token: Option<NewToken>,
    pub enrichment: Option<EnrichedToken>,
    pub score: Option<ScoredRecommendation>,
}

async fn token_view(State(state): State<ApiState>, Path(mint): Path<String>) -> Result<Response, ApiError> {
    let view = TokenView {
        token: state.store.get_new_token(&mint).await?,
        enrichment: state.store.get_enriched(&mint).await?,
        score: state.store.get_score(&mint).await?,
    };
    if view.token.is_none() && view.enrichment.is_none() && view.score.is_none() {
        let body = json!({ "error": "not_found", "message": format!("unknown mint {}", mint) });
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    }
    Ok(Json(view).into_response())
}

async fn activity(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> ApiResult<ActivityStatus> {
    require_api_key(&state, &headers)?;
    Ok(Json(state.registry.check(&wallet).await?))
}

#[derive(Debug, Deserialize)]
struct BulkActivity {
    wallets: Vec<String>,
}

async fn bulk_activity(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<BulkActivity>,
) -> ApiResult<Vec<ActivityStatus>> {
    require_api_key(&state, &headers)?;
    Ok(Json(state.registry.bulk_check(&body.wallets).await?))
}

async fn heartbeat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> ApiResult<StatusBody> {
    require_api_key(&state, &headers)?;
    state.registry.heartbeat(&wallet).await?;
    Ok(Json(StatusBody { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct NonceRequest {
    wallet: String,
}

#[derive(Debug, Serialize)]
struct NonceResponse {
    message: String,
}

async fn issue_nonce(State(state): State<ApiState>, Json(body): Json<NonceRequest>) -> ApiResult<NonceResponse> {
    let message = state.auth.issue(&body.wallet).await?;
    Ok(Json(NonceResponse { message }))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    wallet: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    wallet: String,
    verified: bool,
}

async fn verify_nonce(State(state): State<ApiState>, Json(body): Json<VerifyRequest>) -> ApiResult<VerifyResponse> {
    state.auth.verify(&body.wallet, &body.signature).await?;
    Ok(Json(VerifyResponse {
        wallet: body.wallet,
        verified: true,
    }))
}

async fn launch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<LaunchOutcome> {
    require_api_key(&state, &headers)?;
    Ok(Json(state.launches.launch(request).await?))
}

async fn metrics(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot().await)
}

async fn control_socket(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> Result<Response, ApiError> {
    require_api_key(&state, &headers)?;
    Ok(ws.on_upgrade(move |socket| control_loop(socket, state, wallet)))
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ControlEvent) -> Result<()> {
    let payload = serde_json::to_string(event).context("Failed to serialize control event")?;
    sink.send(Message::Text(payload.into()))
        .await
        .context("Failed to send control event")?;
    Ok(())
}

async fn control_loop(socket: WebSocket, state: ApiState, wallet: String) {
    let Subscription { replay, mut receiver } = state.control.attach(&wallet);
    let (mut sink, mut stream) = socket.split();
    debug!("Control socket opened for {} ({} replayed)", wallet, replay.len());

    let mut open = true;
    for event in &replay {
        if send_event(&mut sink, event).await.is_err() {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => open = send_event(&mut sink, &event).await.is_ok(),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Control socket for {} lagged by {} events", wallet, missed);
                }
                Err(broadcast::error::RecvError::Closed) => open = false,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_message(&state, &wallet, &text).await;
                    open = send_event(&mut sink, &reply).await.is_ok();
                }
                Some(Ok(Message::Ping(payload))) => {
                    open = sink.send(Message::Pong(payload)).await.is_ok();
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                Some(Ok(_)) => {}
            },
        }
    }

    state.control.detach(&wallet);
    debug!("Control socket closed for {}", wallet);
}

/// Apply one client message and build the reply.
pub async fn handle_client_message(state: &ApiState, wallet: &str, text: &str) -> ControlEvent {
    let reply_id = format!("config:{}", to_millis(now_naive()));
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return ControlEvent::bot_log(reply_id, "error", format!("unreadable message: {}", e)),
    };

    match message {
        ClientMessage::Ping { id } => ControlEvent::Pong { id },
        ClientMessage::UpdateConfig {
            sniper_policy,
            exit_policy,
        } => match update_policies(state, wallet, sniper_policy, exit_policy).await {
            Ok(()) => ControlEvent::bot_log(reply_id, "info", "policies updated"),
            Err(e) => ControlEvent::bot_log(reply_id, "error", format!("policy update failed: {}", e)),
        },
    }
}

async fn update_policies(
    state: &ApiState,
    wallet: &str,
    sniper_policy: Option<crate::types::SniperPolicy>,
    exit_policy: Option<crate::types::ExitPolicy>,
) -> Result<(), PipelineError> {
    let user = state
        .store
        .get_user(wallet)
        .await?
        .ok_or_else(|| PipelineError::validation(format!("unknown user {}", wallet)))?;
    let sniper = sniper_policy.unwrap_or(user.sniper_policy);
    let exit = exit_policy.unwrap_or(user.exit_policy);
    state.store.update_user_policies(wallet, &sniper, &exit).await?;
    info!("Policies updated for {}", wallet);
    Ok(())
}
