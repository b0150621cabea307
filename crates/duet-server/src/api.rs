//! HTTP endpoints for session bookkeeping.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use duet_core::SessionId;
use duet_store::StoreError;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::AppState;

/// Failure of an HTTP handler, rendered as `{ "error": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("{context}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ApiError {
    fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { context, source }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Store { context, source } = &self {
            tracing::error!(error = %source, "{context}");
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn create_session(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let session = state
        .router
        .log()
        .create_session()
        .await
        .map_err(ApiError::store("Failed to create session"))?;
    tracing::info!(session_id = %session.id, "session created");
    Ok(Json(json!({ "sessionId": session.id })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = SessionId::from_raw(id);
    let log = state.router.log();
    let session = log
        .get_session(&id)
        .await
        .map_err(ApiError::store("Failed to fetch session"))?
        .ok_or(ApiError::SessionNotFound)?;
    let messages = log
        .messages_for_session(&id)
        .await
        .map_err(ApiError::store("Failed to fetch session"))?;
    Ok(Json(json!({ "session": session, "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    1000
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state
        .router
        .log()
        .list_sessions(params.limit, params.offset)
        .await
        .map_err(ApiError::store("Failed to list sessions"))?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// Administrative purge. Succeeds whether or not the session existed.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = SessionId::from_raw(id);
    let removed = state
        .router
        .log()
        .delete_session(&id)
        .await
        .map_err(ApiError::store("Failed to delete session"))?;
    tracing::info!(session_id = %id, removed, "session deleted");
    Ok(Json(json!({ "success": true })))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.router.log().is_healthy();
    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let registry = state.router.registry();
    (
        code,
        Json(json!({
            "status": status,
            "components": { "database": if db_ok { "ok" } else { "unavailable" } },
            "connections": registry.count(),
            "rooms": registry.room_count(),
        })),
    )
}
