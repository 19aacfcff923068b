use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::engine::broadcaster::Subscription;
use crate::error::AppError;
use crate::state::AppState;

pub async fn tracking_ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.broadcaster.subscribe(&id) {
        Some(subscription) => ws
            .on_upgrade(move |socket| handle_tracking_socket(socket, subscription))
            .into_response(),
        None => AppError::NotFound(format!("no active session for delivery {id}")).into_response(),
    }
}

async fn handle_tracking_socket(socket: WebSocket, mut subscription: Subscription) {
    let delivery_id = subscription.delivery_id().to_string();
    let (mut sender, mut receiver) = socket.split();

    info!(delivery_id = %delivery_id, "tracking websocket connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(update) = subscription.recv().await {
            let Some(json) = to_json(&update) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(delivery_id = %delivery_id, "tracking websocket disconnected");
}

pub async fn proximity_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_proximity_socket(socket, state))
}

async fn handle_proximity_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.proximity_events_tx.subscribe();

    info!("proximity websocket connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "proximity websocket lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(json) = to_json(&event) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("proximity websocket disconnected");
}

fn to_json<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(json) => Some(json),
        Err(err) => {
            warn!(error = %err, "failed to serialize websocket payload");
            None
        }
    }
}
