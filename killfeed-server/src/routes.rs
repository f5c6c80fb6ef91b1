//! HTTP surface (§6): killmail/system lookups, subscription management, status
//! and metrics exposition.

use std::collections::HashSet;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};

use killfeed_core::{
    emit_best_effort, BackfillConfig, PipelineError, StatusSnapshot, Subscription,
    SubscriptionEvent,
};

use crate::state::AppState;

/// The default page size for `GET /system_killmails/:system_id`. Not exposed as a
/// query parameter (§6 names no tunable here); matches the cache's own per-system cap.
const DEFAULT_RECENT_LIMIT: usize = 50;

/// Uniform error envelope (§7: "HTTP endpoints return `{status: "error", reason}`").
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.as_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "status": "error", "reason": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct KillmailResponse {
    status: &'static str,
    killmail: killfeed_core::EnrichedKillmail,
}

#[derive(Serialize)]
struct SystemKillmailsResponse {
    status: &'static str,
    system_id: u32,
    killmails: Vec<killfeed_core::EnrichedKillmail>,
}

#[derive(Serialize)]
struct KillCountResponse {
    status: &'static str,
    system_id: u32,
    count: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/killmail/:id", get(get_killmail))
        .route("/system_killmails/:system_id", get(system_killmails))
        .route("/kills_for_system/:system_id", get(kills_for_system_redirect))
        .route("/kill_count/:system_id", get(kill_count))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions/:subscriber_id", delete(delete_subscription))
        .route("/ws", get(crate::ws::upgrade))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn get_killmail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KillmailResponse>, ApiError> {
    let id: u64 = id
        .parse()
        .map_err(|_| ApiError(PipelineError::Validation(format!("{id} is not a valid killmail id"))))?;
    let killmail = state
        .event_store
        .find_by_killmail_id(id)
        .ok_or_else(|| ApiError(PipelineError::NotFound(format!("killmail {id}"))))?;
    Ok(Json(KillmailResponse { status: "ok", killmail }))
}

async fn system_killmails(
    State(state): State<AppState>,
    Path(system_id): Path<u32>,
) -> Json<SystemKillmailsResponse> {
    let killmails = state.event_store.recent(system_id, DEFAULT_RECENT_LIMIT);
    Json(SystemKillmailsResponse { status: "ok", system_id, killmails })
}

async fn kills_for_system_redirect(Path(system_id): Path<u32>) -> Redirect {
    Redirect::found(&format!("/system_killmails/{system_id}"))
}

async fn kill_count(State(state): State<AppState>, Path(system_id): Path<u32>) -> Json<KillCountResponse> {
    let count = state.broadcaster.kill_count(system_id);
    Json(KillCountResponse { status: "ok", system_id, count })
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let metric_families = state.metrics_registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError(PipelineError::Parse(format!("failed to encode metrics: {e}"))))?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response())
}

/// Request body for `POST /subscriptions` — webhook-only subscribers with no
/// websocket channel to join through (beyond the literal §6 route table, grounded
/// in the same validation the channel join path uses).
#[derive(Deserialize)]
struct CreateSubscriptionRequest {
    subscriber_id: String,
    system_ids: HashSet<u32>,
    callback_url: String,
    #[serde(default)]
    backfill: Option<BackfillConfig>,
}

#[derive(Serialize)]
struct SubscriptionResponse {
    status: &'static str,
    subscription: Subscription,
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let system_count = req.system_ids.len();
    let result = state.subscriptions.subscribe(
        req.subscriber_id,
        req.system_ids,
        Some(req.callback_url),
        req.backfill.unwrap_or_default(),
    );
    match result {
        Ok(subscription) => {
            emit_best_effort(
                state.sink.clone(),
                SubscriptionEvent::Subscribed { sub_id: subscription.sub_id.clone(), system_count }
                    .into(),
            )
            .await;
            Ok(Json(SubscriptionResponse { status: "ok", subscription }))
        }
        Err(e) => {
            emit_best_effort(
                state.sink.clone(),
                SubscriptionEvent::Rejected { reason: e.to_string() }.into(),
            )
            .await;
            Err(e.into())
        }
    }
}

async fn delete_subscription(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> Json<serde_json::Value> {
    let removed = state.subscriptions.unsubscribe(&subscriber_id);
    emit_best_effort(
        state.sink.clone(),
        SubscriptionEvent::Unsubscribed { subscriber_id }.into(),
    )
    .await;
    Json(serde_json::json!({ "status": "ok", "removed": removed }))
}
