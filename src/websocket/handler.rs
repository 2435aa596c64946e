use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::{now_ms, FeedCommand, LedgerEvent};
use crate::AppState;

/// Identity the admin feed connections register under.
const ADMIN_FEED_USER: &str = "admin-feed";

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    token: Option<String>,
    /// Only stream this user's events
    user_id: Option<String>,
}

/// Admin trade feed upgrade handler. Requires `?token=` to match the
/// configured feed token.
pub async fn admin_feed_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Response {
    let authorized = match (&state.config.admin_feed_token, &params.token) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    if !authorized {
        warn!("Rejected admin feed connection with a missing or bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, watch: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = state.registry.register(ADMIN_FEED_USER, tx);
    state.registry.subscribe_admin(conn_id, watch);
    info!("Admin feed connected: {}", conn_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received message from {}: {}", conn_id, text);
                handle_message(&state, conn_id, &text);
            }
            Ok(Message::Close(_)) => {
                info!("Admin feed disconnecting: {}", conn_id);
                break;
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", conn_id, e);
                break;
            }
            _ => {}
        }
    }

    state.registry.unregister(conn_id);
    send_task.abort();
    info!("Admin feed disconnected: {}", conn_id);
}

fn handle_message(state: &AppState, conn_id: Uuid, text: &str) {
    let command: FeedCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            state.registry.send_to(
                conn_id,
                &LedgerEvent::Error {
                    message: format!("Invalid message: {}", e),
                },
            );
            return;
        }
    };

    match command {
        FeedCommand::Ping => {
            state
                .registry
                .send_to(conn_id, &LedgerEvent::Pong { timestamp: now_ms() });
        }
        FeedCommand::Watch { user_id } => {
            debug!("Admin feed {} now watching {:?}", conn_id, user_id);
            state.registry.subscribe_admin(conn_id, user_id);
        }
    }
}
