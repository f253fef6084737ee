//! The broker binary's axum glue: route table, the storage→engine
//! orchestration loop, and the in-memory storage stand-in. None of this is
//! THE CORE (`spec.md` §1) — it is the minimal concrete wiring needed to
//! run `broker-core`'s fan-out engine end to end.

pub mod auth;
pub mod http;
pub mod state;
pub mod storage;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;
use broker_core::{Engine, StorageEvent};
use tracing::{debug, warn};

/// Build the full route table: REST CRUD under `/*key`, the subscribe
/// WebSocket under `/ws/*key`, and the opaque clock side-channel at `/`
/// (§6.2–§6.4). REST and WS share the same key namespace but live under
/// distinct prefixes here — full HTTP routing is out of scope (§1); this is
/// the minimal split that lets one process serve both without a combined
/// upgrade-or-REST dispatcher.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::clock_handler))
        .route("/healthz", get(http::healthz))
        .route("/ws/*key", get(ws::subscribe_handler))
        .route(
            "/*key",
            get(http::get_key)
                .put(http::set_key)
                .post(http::push_key)
                .delete(http::delete_key),
        )
        .with_state(state)
}

/// Drain `storage`'s mutation event stream and feed every event into the
/// broadcast engine, forever. This is the "orchestration glue" wiring
/// storage events to the fan-out engine (`spec.md` §2 data-flow diagram).
/// Spawn this once at startup; it runs until the sender side (the storage
/// implementation) is dropped.
pub fn spawn_broadcast_loop(
    mut events: tokio::sync::mpsc::Receiver<StorageEvent>,
    engine: std::sync::Arc<Engine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(key = %event.key, "dispatching storage event to broadcast engine");
            engine.broadcast(event).await;
        }
        warn!("storage event channel closed; broadcast loop exiting");
    })
}
