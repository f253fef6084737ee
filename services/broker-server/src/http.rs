//! The minimal REST CRUD surface §6.4 asks the core to supply for
//! completeness: `GET` (object or list), `PUT` (set), `POST` (push to a
//! glob), `DELETE`. Full routing, the explorer API, and the web UI SPA are
//! out of scope (§1) — this is just enough to drive the broker end to end.
//! Grounded on `services/http/races.rs`'s handler shape (`State<AppState>`
//! + `Path<String>` + a `StatusCode`/`Json` response pair).

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker_core::storage::StorageError;
use broker_protocol::{path, HttpErrorEnvelope};
use serde_json::Value;

use crate::auth::{extract_bearer, is_authorized};
use crate::state::AppState;

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer);
    if is_authorized(state.auth_token.as_deref(), token) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid or missing bearer token"))
    }
}

fn storage_error_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        StorageError::WriteToGlobPath(_) | StorageError::PushToLiteralPath(_) => StatusCode::BAD_REQUEST,
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.to_owned(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

fn storage_error_response(err: StorageError) -> Response {
    let status = storage_error_status(&err);
    error_response(status, "storage_error", err.to_string())
}

/// `GET /<key>`: a literal key returns its single object; a glob key
/// returns the ascending-by-`Created` list beneath it.
pub async fn get_key(State(state): State<AppState>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if path::is_glob(&key) {
        match state.storage.get_list(&key).await {
            Ok(objects) => Json(objects).into_response(),
            Err(err) => storage_error_response(err),
        }
    } else {
        match state.storage.get(&key).await {
            Ok(object) => Json(object).into_response(),
            Err(err) => storage_error_response(err),
        }
    }
}

/// `PUT /<key>`: write `data` at a literal key. Rejects a glob path.
pub async fn set_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(data): Json<Value>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.storage.set(&key, data).await {
        Ok(object) => Json(object).into_response(),
        Err(err) => storage_error_response(err),
    }
}

/// `POST /<path-with-*>`: insert `data` at a freshly generated key under a
/// glob. Rejects a non-glob path.
pub async fn push_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(glob): Path<String>,
    Json(data): Json<Value>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.storage.push(&glob, data).await {
        Ok(object) => (StatusCode::CREATED, Json(object)).into_response(),
        Err(err) => storage_error_response(err),
    }
}

/// `DELETE /<key>`: delete one object (literal key) or wipe every object
/// beneath a glob.
pub async fn delete_key(State(state): State<AppState>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.storage.del(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => storage_error_response(err),
    }
}

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_status_maps_every_variant_to_bad_request() {
        assert_eq!(
            storage_error_status(&StorageError::InvalidKey("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            storage_error_status(&StorageError::WriteToGlobPath("x/*".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            storage_error_status(&StorageError::PushToLiteralPath("x".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
