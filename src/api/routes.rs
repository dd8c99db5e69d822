use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::backtest::{BacktestError, BacktestRequest, BacktestRunner};
use crate::engine::{Engine, EvalError, EvalRequest, EvalResponse, SaveError, TestRunResult};
use crate::models::{BacktestTask, RuleDefinition, RuleRevision};
use crate::shadow::{ShadowError, ShadowManager};
use crate::typing::FieldType;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub shadow: Arc<ShadowManager>,
    pub backtests: BacktestRunner,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/evaluate", post(evaluate))
        .route("/api/rules", post(create_rule))
        .route("/api/rules/verify", post(verify_rule))
        .route("/api/rules/test", post(test_rule))
        .route("/api/rules/:rid", get(get_rule).put(update_rule))
        .route("/api/shadow/stats", get(shadow_stats))
        .route("/api/shadow/:rid/deploy", post(deploy_shadow))
        .route("/api/shadow/:rid/promote", post(promote_shadow))
        .route("/api/shadow/:rid", delete(remove_shadow))
        .route("/api/backtests", post(submit_backtest))
        .route("/api/backtests/:id", get(get_backtest))
        .route("/api/fields/observations", get(get_observations))
        .route("/api/fields/:name/type", put(set_field_type))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Evaluate one event against the full active rule set
async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvalRequest>,
) -> Result<Json<EvalResponse>, ApiError> {
    let response = state.engine.evaluate(&request)?;
    Ok(Json(response))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<SaveRuleRequest>,
) -> Result<(StatusCode, Json<RuleDefinition>), ApiError> {
    let rule = state.engine.create_rule(
        &body.rid,
        &body.logic,
        body.description.as_deref().unwrap_or(""),
        body.changed_by.as_deref().unwrap_or("api"),
    )?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(rid): Path<String>,
    Json(body): Json<UpdateRuleRequest>,
) -> Result<Json<RuleDefinition>, ApiError> {
    // Reject unknown rids up front so the storage layer never invents rows.
    if state.engine.db.get_rule(&rid)?.is_none() {
        return Err(ApiError::NotFound(format!("Rule '{}' not found", rid)));
    }
    let rule = state.engine.update_rule(
        &rid,
        &body.logic,
        body.description.as_deref().unwrap_or(""),
        body.changed_by.as_deref().unwrap_or("api"),
    )?;
    Ok(Json(rule))
}

/// Get a rule with its revision history
async fn get_rule(
    State(state): State<AppState>,
    Path(rid): Path<String>,
) -> Result<Json<RuleWithHistory>, ApiError> {
    let rule = state
        .engine
        .db
        .get_rule(&rid)?
        .ok_or(ApiError::NotFound(format!("Rule '{}' not found", rid)))?;
    let history = state.engine.db.get_rule_history(&rid)?;
    Ok(Json(RuleWithHistory { rule, history }))
}

/// Static verification: compile and report referenced event fields
async fn verify_rule(
    State(state): State<AppState>,
    Json(body): Json<LogicRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let params = state
        .engine
        .verify_rule(&body.logic)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(VerifyResponse { params }))
}

/// Single-shot dry run against a caller-supplied payload
async fn test_rule(
    State(state): State<AppState>,
    Json(body): Json<TestRuleRequest>,
) -> Result<Json<TestRunResult>, ApiError> {
    let result = state.engine.test_rule(&body.logic, &body.test_data)?;
    Ok(Json(result))
}

async fn deploy_shadow(
    State(state): State<AppState>,
    Path(rid): Path<String>,
    Json(body): Json<DeployShadowRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.shadow.deploy(
        &rid,
        body.draft_logic.as_deref(),
        body.draft_description.as_deref(),
    )?;
    Ok(Json(json!({ "rid": rid, "status": "deployed" })))
}

async fn remove_shadow(
    State(state): State<AppState>,
    Path(rid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.shadow.remove(&rid)?;
    Ok(Json(json!({ "rid": rid, "status": "removed" })))
}

async fn promote_shadow(
    State(state): State<AppState>,
    Path(rid): Path<String>,
    Json(body): Json<PromoteRequest>,
) -> Result<Json<RuleDefinition>, ApiError> {
    let rule = state
        .shadow
        .promote(&rid, body.changed_by.as_deref().unwrap_or("api"))?;
    Ok(Json(rule))
}

/// Shadow vs production outcome distributions per deployed rule
async fn shadow_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.shadow.stats()?;
    Ok(Json(json!({ "rules": stats })))
}

/// Submit a backtest; the replay runs off the request path
async fn submit_backtest(
    State(state): State<AppState>,
    Json(body): Json<BacktestRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let task = state.backtests.submit(&body)?;
    let runner = state.backtests.clone();
    let task_id = task.id.clone();
    tokio::task::spawn_blocking(move || runner.run(&task_id, &body));
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task.id }))))
}

/// Poll a backtest task (idempotent)
async fn get_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BacktestTask>, ApiError> {
    state
        .backtests
        .status(&id)?
        .map(Json)
        .ok_or(ApiError::NotFound(format!("Backtest {} not found", id)))
}

/// Configure (or reconfigure) one field's cast
async fn set_field_type(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<FieldTypeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ty = FieldType::from_parts(&body.field_type, body.format.as_deref()).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unknown field type '{}' (datetime requires a format)",
            body.field_type
        ))
    })?;
    state.engine.db.set_field_type(&name, &ty)?;
    Ok(Json(json!({ "field": name, "field_type": ty.as_str() })))
}

/// Runtime-type observations for drift inspection
async fn get_observations(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let observations = state.engine.db.get_observations()?;
    Ok(Json(json!({ "observations": observations })))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct SaveRuleRequest {
    rid: String,
    logic: String,
    description: Option<String>,
    changed_by: Option<String>,
}

#[derive(Deserialize)]
struct UpdateRuleRequest {
    logic: String,
    description: Option<String>,
    changed_by: Option<String>,
}

#[derive(Serialize)]
struct RuleWithHistory {
    rule: RuleDefinition,
    history: Vec<RuleRevision>,
}

#[derive(Deserialize)]
struct LogicRequest {
    logic: String,
}

#[derive(Serialize)]
struct VerifyResponse {
    params: Vec<String>,
}

#[derive(Deserialize)]
struct TestRuleRequest {
    logic: String,
    test_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct DeployShadowRequest {
    draft_logic: Option<String>,
    draft_description: Option<String>,
}

#[derive(Deserialize, Default)]
struct PromoteRequest {
    changed_by: Option<String>,
}

#[derive(Deserialize)]
struct FieldTypeRequest {
    field_type: String,
    format: Option<String>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<EvalError> for ApiError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Cast(cast) => ApiError::BadRequest(cast.to_string()),
            EvalError::AllRulesFailed { .. } => ApiError::Internal(anyhow::anyhow!("{err}")),
            EvalError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl From<SaveError> for ApiError {
    fn from(err: SaveError) -> Self {
        match err {
            SaveError::Compile(_) | SaveError::OutcomeNotAllowed(_) => {
                ApiError::BadRequest(err.to_string())
            }
            SaveError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl From<ShadowError> for ApiError {
    fn from(err: ShadowError) -> Self {
        match err {
            ShadowError::InvalidDraft(_) => ApiError::BadRequest(err.to_string()),
            ShadowError::UnknownRule(_) | ShadowError::NotDeployed(_) => {
                ApiError::NotFound(err.to_string())
            }
            ShadowError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl From<BacktestError> for ApiError {
    fn from(err: BacktestError) -> Self {
        match err {
            BacktestError::UnknownRule(_) => ApiError::NotFound(err.to_string()),
            BacktestError::Compile(_) => ApiError::BadRequest(err.to_string()),
            BacktestError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_internal() {
        let err = anyhow::anyhow!("disk gone");
        let api_err: ApiError = err.into();
        match api_err {
            ApiError::Internal(_) => (),
            _ => panic!("Expected Internal error"),
        }
    }

    #[test]
    fn whole_set_failures_map_to_internal() {
        let err = EvalError::AllRulesFailed {
            failed: 3,
            last: crate::rules::RuntimeError::MissingField("x".to_string()),
        };
        match ApiError::from(err) {
            ApiError::Internal(err) => assert!(err.to_string().contains("3 active rules")),
            other => panic!("Expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn cast_errors_map_to_bad_request() {
        let err = EvalError::Cast(crate::typing::CastError {
            field: "amount".to_string(),
            value: "\"oops\"".to_string(),
            target: "float",
        });
        match ApiError::from(err) {
            ApiError::BadRequest(msg) => assert!(msg.contains("amount")),
            other => panic!("Expected BadRequest, got {other:?}"),
        }
    }
}
