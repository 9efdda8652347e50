//! HTTP API.
//!
//! Three endpoints: submit an onboarding request, poll execution progress,
//! and cancel. Submission validates synchronously (early-fail is the point),
//! then detaches the worker-pool phase and returns the execution id.

use crate::application::orchestrator::{OnboardingRequest, OnboardingService, SubmitOutcome};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<OnboardingService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/analyze", post(submit_analysis))
        .route("/executions", get(list_executions))
        .route("/execution/{id}", get(execution_status))
        .route("/execution/{id}/cancel", post(cancel_execution))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    execution_id: String,
    status: &'static str,
}

async fn submit_analysis(
    State(state): State<ApiState>,
    Json(request): Json<OnboardingRequest>,
) -> Result<Json<AcceptedResponse>, (StatusCode, Json<serde_json::Value>)> {
    match state.service.submit(&request).await {
        Ok(SubmitOutcome::Accepted { execution, tasks }) => {
            let service = state.service.clone();
            let execution_id = execution.execution_id.clone();
            // The analysis phase runs detached; the caller polls.
            tokio::spawn(async move {
                if let Err(e) = service.run_to_completion(&execution, tasks).await {
                    error!("Execution {} crashed: {:#}", execution.execution_id, e);
                }
            });
            Ok(Json(AcceptedResponse {
                execution_id,
                status: "pending",
            }))
        }
        Ok(SubmitOutcome::Rejected {
            execution_id,
            failure,
        }) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "validation_failed",
                "execution_id": execution_id,
                "reason": failure.reason,
                "step": failure.step,
                "suggestion": failure.suggestion,
                "metadata": failure.metadata,
            })),
        )),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("{:#}", e) })),
        )),
    }
}

#[derive(Debug, serde::Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_executions(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.service.list_recent(limit).await {
        Ok(executions) => {
            let rows: Vec<serde_json::Value> = executions
                .iter()
                .map(|e| {
                    json!({
                        "execution_id": e.execution_id,
                        "symbol": e.symbol,
                        "mode": e.mode,
                        "status": e.status,
                        "progress_percent": e.progress_percent,
                        "started_at": e.started_at,
                        "completed_at": e.completed_at,
                    })
                })
                .collect();
            Ok(Json(json!({ "executions": rows })))
        }
        Err(e) => {
            error!("Listing executions failed: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn execution_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.execution_report(&id).await {
        Ok(Some(report)) => Ok(Json(
            serde_json::to_value(report).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        )),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Status poll for {} failed: {:#}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn cancel_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.cancel(&id).await {
        Ok(accepted) => Ok(Json(json!({ "accepted": accepted }))),
        Err(e) => {
            error!("Cancel of {} failed: {:#}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
