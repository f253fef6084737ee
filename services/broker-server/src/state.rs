//! Shared application state, handed to every axum handler via `State`.
//! Mirrors `AppState`'s role in the teacher's server crate: one `Clone`able
//! handle wrapping the registries the handlers need.

use std::sync::Arc;

use broker_core::{Engine, Storage};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub engine: Arc<Engine>,
    pub auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<Engine>, auth_token: Option<String>) -> Self {
        AppState {
            storage,
            engine,
            auth_token: auth_token.map(|t| t.into()),
        }
    }
}
