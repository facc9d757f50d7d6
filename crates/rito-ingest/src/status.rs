//! `/health` and `/status` endpoints served next to `/metrics`.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use rito_core::{CursorStatus, JETSTREAM_SERVICE, derive_status};
use serde::Serialize;

use crate::store::CursorStore;

#[derive(Clone)]
pub struct StatusState {
    cursors: CursorStore,
    service: &'static str,
}

impl StatusState {
    pub fn new(cursors: CursorStore) -> Self {
        Self {
            cursors,
            service: JETSTREAM_SERVICE,
        }
    }
}

/// Build the diagnostics router.
///
/// - `GET /health` - plain `OK`
/// - `GET /status` - ingestion lag derived from the checkpointed cursor
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn health() -> &'static str {
    "OK"
}

/// `GET /status`
pub async fn status(State(state): State<StatusState>) -> Result<Json<CursorStatus>, StatusError> {
    let cursor = state.cursors.get(state.service)?;
    Ok(Json(derive_status(chrono::Utc::now(), cursor)))
}

/// Failure reading the cursor.
#[derive(Debug, thiserror::Error)]
#[error("cursor lookup failed: {0}")]
pub struct StatusError(#[from] crate::Error);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "status lookup failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "cursor_unavailable",
            }),
        )
            .into_response()
    }
}
