//! Channel protocol (§6): clients connect, join topic `killmails:lobby` with a
//! system-id filter, and receive `detailed_kill_update` / `kill_count_update` /
//! `preload_*` frames until they disconnect.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use killfeed_core::{emit_best_effort, BackfillConfig, SubscriptionEvent};

use crate::state::AppState;

/// Join payload a client sends as its first text frame after upgrade.
#[derive(Deserialize)]
struct JoinRequest {
    subscriber_id: String,
    system_ids: HashSet<u32>,
    #[serde(default)]
    historical_config: Option<BackfillConfig>,
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let join = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<JoinRequest>(&text) {
                Ok(join) => break join,
                Err(e) => {
                    let _ = send_error(&mut socket, &format!("invalid join payload: {e}")).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    let backfill = join.historical_config.unwrap_or_default();
    let subscription =
        match state.subscriptions.subscribe(join.subscriber_id.clone(), join.system_ids, None, backfill) {
            Ok(sub) => sub,
            Err(e) => {
                emit_best_effort(
                    state.sink.clone(),
                    SubscriptionEvent::Rejected { reason: e.to_string() }.into(),
                )
                .await;
                let _ = send_error(&mut socket, &e.to_string()).await;
                return;
            }
        };

    let system_count = subscription.system_ids.len();
    emit_best_effort(
        state.sink.clone(),
        SubscriptionEvent::Subscribed { sub_id: subscription.sub_id.clone(), system_count }.into(),
    )
    .await;

    let mut updates = state.broadcaster.attach_channel(&subscription.sub_id);
    let connected_at = state.clock.now_millis();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(message) => {
                        let frame = match serde_json::to_string(&message) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.broadcaster.detach_channel(&subscription.sub_id);
    let removed = state.subscriptions.unsubscribe(&join.subscriber_id);
    emit_best_effort(
        state.sink.clone(),
        SubscriptionEvent::Unsubscribed { subscriber_id: join.subscriber_id.clone() }.into(),
    )
    .await;

    let duration_ms = state.clock.now_millis().saturating_sub(connected_at);
    tracing::info!(
        subscriber_id = %join.subscriber_id,
        sub_id = %subscription.sub_id,
        removed,
        duration_ms,
        "channel client disconnected",
    );
}

async fn send_error(socket: &mut WebSocket, reason: &str) -> Result<(), axum::Error> {
    let frame = json!({ "status": "error", "reason": reason }).to_string();
    socket.send(Message::Text(frame)).await
}
