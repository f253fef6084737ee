//! WebSocket façades: the subscribe endpoint (§6.2) and the opaque clock
//! side-channel (§6.3). Grounded on `services/ws_receiver.rs`'s
//! upgrade-then-split-socket shape; the broadcast engine never sees axum
//! types, only the `Connection` trait this module implements over the
//! split sink half.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use broker_core::broadcast::SubscribeError;
use broker_core::{Connection, ConnectionError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::auth::{extract_bearer, is_authorized};
use crate::state::AppState;

const CLOCK_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Adapts the axum split sink half to the core's transport-agnostic
/// `Connection` trait. A `tokio::sync::Mutex` rather than a plain lock
/// because `Sink::send` is async; the pool mutex upstream already
/// serialises calls into this per-connection, so contention here is only
/// ever the uncontended fast path.
struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(bytes))
            .await
            .map_err(|_| ConnectionError)
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(str::to_owned)
}

/// `GET /ws/<key>` — upgrade to WebSocket, subprotocol `bearer`, and join
/// the subscription pool for `key` (literal or glob).
pub async fn subscribe_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = bearer_from_headers(&headers);
    ws.protocols(["bearer"])
        .on_upgrade(move |socket| handle_subscribe_socket(socket, state, key, token))
}

async fn handle_subscribe_socket(socket: WebSocket, state: AppState, key: String, token: Option<String>) {
    if !broker_protocol::path::is_valid(&key) {
        debug!(%key, "rejecting subscribe: invalid key");
        return;
    }
    if !is_authorized(state.auth_token.as_deref(), token.as_deref()) {
        debug!(%key, "rejecting subscribe: bad bearer token");
        return;
    }

    let (sink, mut stream) = socket.split();
    let conn = Arc::new(WsConnection {
        sink: Mutex::new(sink),
    });

    // The initial snapshot write happens inside `Engine::subscribe`, on the
    // connection handed in here, before it is added to the pool — see
    // §4.4.5. A failure means the handshake already succeeded but the
    // snapshot write did not; nothing more can be done on this socket.
    let id = match state.engine.subscribe(&key, conn.clone()).await {
        Ok(id) => id,
        Err(SubscribeError::Hijacked(_)) => {
            warn!(%key, "hijacked: initial snapshot write failed on a fresh connection");
            return;
        }
        Err(SubscribeError::Rejected(_)) => {
            debug!(%key, "rejecting subscribe: on-subscribe hook declined the connection");
            return;
        }
    };

    // Clients never need to send anything (§6.2); this loop exists purely
    // to detect disconnection so the connection can be dropped from its
    // pool promptly rather than waiting for the next failed write.
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(payload)) => {
                if conn.sink.lock().await.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
        }
    }
    state.engine.unsubscribe(&key, id).await;
}

/// `GET /` — the clock side-channel (§6.3): raw ASCII numeric broadcasts of
/// the monotonic clock, opaque to the patch-based broadcast engine.
pub async fn clock_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_clock_socket(socket, state))
}

async fn handle_clock_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval(CLOCK_TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let tick = state.engine.clock().now().to_string();
                if sink.send(Message::Text(tick.into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
