//! keyfed callback service
//!
//! The federation gateway calls `/version/v1/callback` whenever a new batch
//! is available. The batch is recorded as unprocessed; the next download run
//! fetches it.

pub mod config;
pub use config::CallbackServiceConfig;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use keyfed_core::{CoreError, FederationBatchInfo, FederationStateStore, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid callback: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Store(#[from] CoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!("Callback failed: {}", self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "batchTag")]
    pub batch_tag: String,
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    batch_tag: String,
    date: NaiveDate,
    /// False when the batch was already known
    recorded: bool,
}

/// Create the router with the specified state
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/version/v1/callback", get(batch_available))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn batch_available(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.batch_tag.trim().is_empty() {
        return Err(ApiError::BadRequest("batchTag must not be empty".to_string()));
    }

    let info = FederationBatchInfo::unprocessed(query.batch_tag.clone(), query.date);
    let recorded = state.store.insert_batch_info(&info)?;
    if recorded {
        tracing::info!("Batch {} for {} announced", info.batch_tag, info.date);
    } else {
        tracing::debug!("Batch {} already known", info.batch_tag);
    }

    Ok(Json(CallbackResponse {
        batch_tag: info.batch_tag,
        date: info.date,
        recorded,
    }))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}
