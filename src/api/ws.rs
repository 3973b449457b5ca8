// =============================================================================
// WebSocket Handler — status & stream channels over the fan-out bus
// =============================================================================
//
// Clients connect to `{base_path}/ws?channel=status|stream&strategy=<id>`
// (plus `token=` when auth is enabled and `push_interval=raw|<seconds>` to
// override the configured cadence).  Frames are binary: zlib-compressed
// MessagePack maps produced by the fan-out bus.
//
// Each connection drains its own bounded queue; a send that takes longer
// than 2 s closes that subscriber only.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::error::EngineError;
use crate::fanout::{bus::encode_frame, Channel, PushInterval, Subscriber};

/// A send slower than this closes the subscriber.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    push_interval: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(query.token.as_deref().unwrap_or_default()) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let channel = match query.channel.as_deref() {
        Some("stream") => Channel::Stream,
        Some("status") | None => Channel::Status,
        Some(other) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                format!("unknown channel '{other}'"),
            )
                .into_response();
        }
    };

    // An explicit strategy filter must name a configured instance.
    if let Some(id) = query.strategy.as_deref() {
        if state.strategy(id).is_none() {
            return (
                axum::http::StatusCode::NOT_FOUND,
                format!("unknown strategy '{id}'"),
            )
                .into_response();
        }
    }

    let push_interval = query
        .push_interval
        .as_deref()
        .and_then(PushInterval::parse);

    let subscriber = state
        .fanout
        .subscribe(channel, query.strategy.clone(), push_interval);

    info!(
        id = subscriber.id,
        channel = ?channel,
        strategy = ?query.strategy,
        "WebSocket subscriber accepted — upgrading"
    );

    ws.on_upgrade(move |socket| handle_connection(socket, state, subscriber))
        .into_response()
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, sub: Arc<Subscriber>) {
    let (mut sender, mut receiver) = socket.split();

    // Status sessions get the current snapshot immediately; stream sessions
    // start from the next produced frame.
    if sub.channel == Channel::Status {
        let views: Vec<_> = state
            .strategies
            .iter()
            .filter(|s| sub.strategy.as_deref().map_or(true, |f| f == s.id))
            .map(|s| s.status.read().clone())
            .collect();
        for view in views {
            if let Ok(bytes) = encode_frame(&view) {
                if send_frame(&mut sender, bytes, sub.id).await.is_err() {
                    state.fanout.unsubscribe(sub.id);
                    return;
                }
            }
        }
    }

    let mut cadence = match sub.push_interval {
        PushInterval::Raw => None,
        PushInterval::Seconds(n) => Some(interval(Duration::from_secs(n))),
    };

    loop {
        let outgoing: Vec<Arc<Vec<u8>>> = match cadence.as_mut() {
            // Raw: forward every frame as soon as the producer notifies.
            None => {
                tokio::select! {
                    _ = sub.notify.notified() => sub.drain(),
                    msg = receiver.next() => {
                        if !handle_incoming(msg) {
                            break;
                        }
                        continue;
                    }
                }
            }
            // Coalesced: sample the latest frame at the cadence.
            Some(tick) => {
                tokio::select! {
                    _ = tick.tick() => sub.take_latest().into_iter().collect(),
                    msg = receiver.next() => {
                        if !handle_incoming(msg) {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        let mut failed = false;
        for frame in outgoing {
            if send_frame(&mut sender, frame.as_ref().clone(), sub.id).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
    }

    state.fanout.unsubscribe(sub.id);
    info!(id = sub.id, "WebSocket connection closed");
}

/// Returns false when the connection should end.
fn handle_incoming(msg: Option<Result<Message, axum::Error>>) -> bool {
    match msg {
        Some(Ok(Message::Close(_))) | None => false,
        Some(Ok(Message::Text(text))) => {
            // Client text frames are treated as heartbeats.
            debug!(msg = %text, "WebSocket heartbeat");
            true
        }
        Some(Ok(_)) => true, // Ping/Pong handled by axum, binary ignored.
        Some(Err(e)) => {
            warn!(error = %e, "WebSocket receive error");
            false
        }
    }
}

/// Send one binary frame with the subscriber timeout applied.
async fn send_frame<S>(sender: &mut S, bytes: Vec<u8>, sub_id: u64) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(SEND_TIMEOUT, sender.send(Message::Binary(bytes))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "WebSocket send failed");
            Err(())
        }
        Err(_) => {
            let err = EngineError::SubscriberTimeout(sub_id.to_string());
            warn!(error = %err, "closing slow subscriber");
            Err(())
        }
    }
}
