use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{deleted, AppError, AppResult};
use crate::{
    auth::{CurrentUser, Role},
    models::{Page, ScanDetail, ScanFilter, ScanJob, ScanListItem, ToolType},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScanRequest {
    asset_id: Uuid,
    tool_type: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<CreateScanRequest>,
) -> AppResult<(StatusCode, Json<ScanJob>)> {
    user.require(&[Role::Admin, Role::Analyst])?;

    let tool: ToolType = payload.tool_type.parse()?;

    // Only accepted submissions count against the budget.
    if !state.rate_limiter.lock().await.allow() {
        return Err(AppError::rate_limited("scan submission rate limit exceeded"));
    }
    match state
        .orchestrator
        .submit(payload.asset_id, tool, &user.actor())
        .await
    {
        Ok(job) => Ok((StatusCode::CREATED, Json(job))),
        Err(e) => {
            state.rate_limiter.lock().await.refund();
            Err(e.into())
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<ScanFilter>,
) -> AppResult<Json<Page<ScanListItem>>> {
    Ok(Json(state.orchestrator.list(&filter).await?))
}

pub async fn by_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<Uuid>,
) -> AppResult<Json<Vec<ScanListItem>>> {
    Ok(Json(state.orchestrator.list_for_asset(asset_id).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<ScanDetail>> {
    Ok(Json(state.orchestrator.get(id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ScanJob>> {
    user.require(&[Role::Admin, Role::Analyst])?;
    Ok(Json(state.orchestrator.cancel(id, &user.actor()).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    user.require(&[Role::Admin])?;
    state.orchestrator.delete(id, &user.actor()).await?;
    Ok(deleted("Scan"))
}
