//! Axum route handlers for the prompt version API.
//!
//! Authentication lives upstream; callers pass the authenticated actor as
//! `actor_id`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAX_HISTORY_PAGE_LIMIT;
use crate::errors::AppError;
use crate::models::prompt::{PromptDocument, VersionRecord, MAX_PROMPT_NAME_LEN};
use crate::state::AppState;
use crate::versioning::service::{Comparison, HistoryAudit, HistoryPage};
use crate::versioning::store::PageRequest;


// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreatePromptRequest {
    pub name: String,
    pub content: String,
    pub message: Option<String>,
    pub actor_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PromptVersionResponse {
    pub prompt: PromptDocument,
    pub version: VersionRecord,
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub content: String,
    pub message: Option<String>,
    pub actor_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub version: i32,
    pub actor_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ApplyRunRequest {
    pub run_id: Uuid,
    pub content: String,
    pub actor_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateRequest {
    pub name: Option<String>,
    pub actor_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub a: i32,
    pub b: i32,
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_PROMPT_NAME_LEN {
        return Err(AppError::Validation(format!(
            "name must be at most {MAX_PROMPT_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_version(field: &str, version: i32) -> Result<(), AppError> {
    if version < 1 {
        return Err(AppError::Validation(format!("{field} must be >= 1")));
    }
    Ok(())
}

fn page_request(query: &HistoryQuery, default_limit: i64) -> Result<PageRequest, AppError> {
    let limit = query.limit.unwrap_or(default_limit);
    if !(1..=MAX_HISTORY_PAGE_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {MAX_HISTORY_PAGE_LIMIT}"
        )));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::Validation("offset must be >= 0".to_string()));
    }
    Ok(PageRequest { limit, offset })
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/prompts
pub async fn handle_create_prompt(
    State(state): State<AppState>,
    Json(req): Json<CreatePromptRequest>,
) -> Result<(StatusCode, Json<PromptVersionResponse>), AppError> {
    validate_name(&req.name)?;
    let (prompt, version) = state
        .versions
        .create_document(req.name.trim(), &req.content, req.message.as_deref(), req.actor_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PromptVersionResponse { prompt, version }),
    ))
}

/// GET /api/v1/prompts/:id
pub async fn handle_get_prompt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PromptDocument>, AppError> {
    Ok(Json(state.versions.document(id).await?))
}

/// POST /api/v1/prompts/:id/versions
///
/// Returns the current head unchanged when the content is identical.
pub async fn handle_create_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateVersionRequest>,
) -> Result<Json<VersionRecord>, AppError> {
    let record = state
        .versions
        .edit(id, &req.content, req.message.as_deref(), req.actor_id)
        .await?;
    Ok(Json(record))
}

/// GET /api/v1/prompts/:id/versions
pub async fn handle_list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, AppError> {
    let page = page_request(&query, state.config.history_page_limit)?;
    Ok(Json(state.versions.history(id, page).await?))
}

/// GET /api/v1/prompts/:id/versions/:version
pub async fn handle_get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, i32)>,
) -> Result<Json<VersionRecord>, AppError> {
    validate_version("version", version)?;
    Ok(Json(state.versions.get_version(id, version).await?))
}

/// POST /api/v1/prompts/:id/revert
pub async fn handle_revert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RevertRequest>,
) -> Result<Json<VersionRecord>, AppError> {
    validate_version("version", req.version)?;
    let record = state
        .versions
        .revert_to(id, req.version, req.actor_id)
        .await?;
    Ok(Json(record))
}

/// POST /api/v1/prompts/:id/apply-run
pub async fn handle_apply_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApplyRunRequest>,
) -> Result<Json<VersionRecord>, AppError> {
    let record = state
        .versions
        .promote_run(id, req.run_id, &req.content, req.actor_id)
        .await?;
    Ok(Json(record))
}

/// POST /api/v1/prompts/:id/duplicate
pub async fn handle_duplicate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DuplicateRequest>,
) -> Result<(StatusCode, Json<PromptVersionResponse>), AppError> {
    if let Some(name) = req.name.as_deref() {
        validate_name(name)?;
    }
    let (prompt, version) = state
        .versions
        .duplicate(id, req.name.as_deref().map(str::trim), req.actor_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PromptVersionResponse { prompt, version }),
    ))
}

/// GET /api/v1/prompts/:id/compare?a=1&b=3
pub async fn handle_compare(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<Comparison>, AppError> {
    validate_version("a", query.a)?;
    validate_version("b", query.b)?;
    Ok(Json(state.versions.compare(id, query.a, query.b).await?))
}

/// GET /api/v1/prompts/:id/audit
pub async fn handle_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryAudit>, AppError> {
    Ok(Json(state.versions.audit_history(id).await?))
}
