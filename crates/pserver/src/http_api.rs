//! HTTP API for the parameter server shard
//!
//! JSON endpoints for trainers and operators. Byte payloads (parameter
//! content, optimizer config) travel as arrays of byte values.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pserver_core::{Error, Gradient, Parameter, ParameterWithConfig};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::service::{PserverService, ServiceStatus};

/// Shared state for HTTP handlers
pub type AppState = Arc<PserverService>;

/// Body returned by operations that carry no result
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

/// Error body with the status derived from the service error
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::AlreadyInitialized => StatusCode::CONFLICT,
            Error::Uninitialized => StatusCode::SERVICE_UNAVAILABLE,
            Error::ParameterNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Optimizer { .. } => StatusCode::BAD_REQUEST,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Create the HTTP API router
pub fn create_router(service: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/params", post(init_param))
        .route("/api/params/finish", post(finish_init_params))
        .route("/api/params/:name", get(get_param))
        .route("/api/grads", post(send_grad))
        .layer(cors)
        .with_state(service)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

async fn get_status(State(service): State<AppState>) -> Json<ServiceStatus> {
    Json(service.status())
}

async fn init_param(
    State(service): State<AppState>,
    Json(param): Json<ParameterWithConfig>,
) -> ApiResult<AckResponse> {
    service.init_param(param)?;
    Ok(Json(AckResponse { success: true }))
}

async fn finish_init_params(State(service): State<AppState>) -> ApiResult<AckResponse> {
    service.finish_init_params().await?;
    Ok(Json(AckResponse { success: true }))
}

async fn send_grad(
    State(service): State<AppState>,
    Json(gradient): Json<Gradient>,
) -> ApiResult<AckResponse> {
    service.send_grad(gradient)?;
    Ok(Json(AckResponse { success: true }))
}

/// Blocks until parameter initialization has finished
async fn get_param(
    State(service): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Parameter> {
    Ok(Json(service.get_param(&name).await?))
}
