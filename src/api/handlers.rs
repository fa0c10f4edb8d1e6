//! HTTP request handlers

use super::types::{
    ConversationResponse, DispatchResponse, ErrorResponse, HealthResponse, LogResponse,
};
use super::AppState;
use crate::db::StoreError;
use crate::normalize::{normalize, NormalizeError, SourceMeta};
use crate::runtime::DispatchError;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

/// Header a transport relay may set with its own hand-off time (RFC 3339)
const DELIVERED_AT_HEADER: &str = "x-delivered-at";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Inbound events
        .route("/webhook/:source", post(receive_event))
        // Inspection
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/log", get(get_conversation_log))
        // Liveness
        .route("/health", get(health))
        .route("/version", get(get_version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================
// Inbound events
// ============================================================

async fn receive_event(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DispatchResponse>, AppError> {
    let meta = SourceMeta {
        source,
        delivered_at: delivered_at(&headers),
    };
    let event = normalize(&body, &meta, state.clock.as_ref())?;

    if let Some(delivered_at) = meta.delivered_at {
        tracing::debug!(
            conv_id = %event.conversation_id,
            source = %meta.source,
            lag_ms = (event.received_at - delivered_at).num_milliseconds(),
            "Transport hand-off lag"
        );
    }

    let outcome = state.manager.submit(event).await?;
    Ok(Json(outcome.into()))
}

fn delivered_at(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get(DELIVERED_AT_HEADER)?.to_str().ok()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================
// Inspection
// ============================================================

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state
        .manager
        .lookup(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Conversation {id} not found")))?;
    Ok(Json(ConversationResponse { conversation }))
}

async fn get_conversation_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LogResponse>, AppError> {
    let entries = state.manager.audit_log(&id).await?;
    Ok(Json(LogResponse {
        conversation_id: id,
        entries,
    }))
}

// ============================================================
// Liveness
// ============================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.backend,
        delivery: state.delivery,
        active_conversations: state.manager.active_conversations().await,
    })
}

async fn get_version() -> &'static str {
    concat!("relaybot ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
    Dispatch(DispatchError),
}

impl From<NormalizeError> for AppError {
    fn from(e: NormalizeError) -> Self {
        match e {
            NormalizeError::MalformedPayload(_) => AppError::BadRequest(e.to_string()),
            NormalizeError::UnsupportedSourceType(_) => AppError::NotFound(e.to_string()),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        AppError::Dispatch(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::BackendUnavailable(_) => AppError::Unavailable(e.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::new(msg)),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(msg)),
            AppError::Dispatch(e) => {
                let status = match e {
                    DispatchError::Contended { .. } => StatusCode::CONFLICT,
                    DispatchError::BackendUnavailable { .. } | DispatchError::Shutdown { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    DispatchError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let (conversation_id, source_seq) = e.identity();
                let body = ErrorResponse {
                    conversation_id: Some(conversation_id.to_string()),
                    source_seq: Some(source_seq),
                    ..ErrorResponse::new(e.to_string())
                };
                (status, body)
            }
        };

        (status, Json(body)).into_response()
    }
}
