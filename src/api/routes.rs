//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::execution::{ExecutionId, ExecutionStatus, SubmitRequest};
use crate::orchestrator::CancelOutcome;

/// Largest page `GET /executions` returns.
const MAX_LIST_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(submit_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn parse_id(raw: &str) -> Result<ExecutionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("malformed execution id '{}'", raw)))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "runner": state.orchestrator.runner_name(),
        "in_flight": state.orchestrator.in_flight(),
    }))
}

async fn submit_execution(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body?;
    let id = state.orchestrator.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        envelope(json!({
            "execution_id": id,
            "status": ExecutionStatus::Pending,
        })),
    ))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&raw)?;
    match state.gateway.get_status(id).await? {
        Some(view) => Ok(envelope(view)),
        None => Err(ApiError::NotFound(format!("execution {} not found", id))),
    }
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&raw)?;
    match state.orchestrator.cancel(id).await? {
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("execution {} not found", id))),
        outcome => Ok(envelope(json!({
            "execution_id": id,
            "cancelled": outcome == CancelOutcome::Cancelled,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<ExecutionStatus>().map_err(ApiError::BadRequest)?),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT);
    let list = state
        .orchestrator
        .ledger()
        .list_recent(limit, status)
        .await?;
    let total = list.len();
    Ok(Json(json!({ "data": list, "meta": { "total": total } })))
}
