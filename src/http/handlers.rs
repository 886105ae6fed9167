use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::State,
    http::{
        HeaderName, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    core::pipeline::{
        executing::{ExecutionService, ServiceError},
        validating::ValidationError,
    },
    http::models::{ExecuteRequest, ExecuteResponse, HealthResponse, LanguageInfo},
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub service: ExecutionService,
    pub languages: Arc<Vec<LanguageInfo>>,
    /// Larger `/execute` bodies are rejected as a validation failure.
    pub max_body_bytes: usize,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/execute", post(execute_handler))
        .route("/health", get(health_handler))
        .route("/languages", get(languages_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Runs the submission on its own task. If the client goes away this future
/// is dropped, the guard cancels the token and the task tears the sandbox down.
#[tracing::instrument(skip_all)]
async fn execute_handler(
    State(state): State<AppState>,
    body: Body,
) -> (StatusCode, Json<ExecuteResponse>) {
    // Also fails when the client aborts mid-body; both end up as a 400.
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!("Failed to buffer request body: {}", e);
            let max = state.max_body_bytes;
            return error_response(ValidationError::RequestTooLarge { max }.into());
        }
    };
    let req: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(ValidationError::MalformedBody { msg: e.to_string() }.into());
        }
    };
    tracing::info!(
        language = ?req.language,
        code_len = req.code.as_ref().map(String::len),
        graded = req.expected_output.is_some(),
        "Received execution request"
    );

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let service = state.service.clone();
    let expected_output = req.expected_output.clone();
    let task = tokio::spawn(async move {
        service
            .submit(req.into(), expected_output.as_deref(), cancel)
            .await
    });

    match task.await {
        Ok(Ok(submission)) => (StatusCode::OK, Json(submission.into())),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            tracing::error!("Execution task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ExecuteResponse::infrastructure_failure()),
            )
        }
    }
}

fn error_response(error: ServiceError) -> (StatusCode, Json<ExecuteResponse>) {
    match error {
        ServiceError::Validation(e) => {
            tracing::debug!("Rejected request: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(ExecuteResponse::failure(e.to_string())),
            )
        }
        ServiceError::Busy => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecuteResponse::failure(
                "Execution service is busy, try again later",
            )),
        ),
        ServiceError::Cancelled => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecuteResponse::failure("Execution cancelled")),
        ),
        ServiceError::Infrastructure { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecuteResponse::infrastructure_failure()),
        ),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_executions: state.service.active_count(),
    })
}

async fn languages_handler(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    Json(state.languages.as_ref().clone())
}
