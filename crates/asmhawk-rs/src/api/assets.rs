use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;

use super::{deleted, AppError, AppResult};
use crate::{
    auth::{CurrentUser, Role},
    db,
    error::ScanError,
    models::{Asset, AssetQuery, AssetStats, AssetUpdate, NewAsset, Page, PageMeta},
    security::validate_target,
    AppState,
};

const DEFAULT_TAKE: i64 = 50;
const MAX_TAKE: i64 = 200;

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(mut payload): Json<NewAsset>,
) -> AppResult<(StatusCode, Json<Asset>)> {
    user.require(&[Role::Admin, Role::Analyst])?;

    payload.domain = payload.domain.trim().to_string();
    validate_target(&payload.domain)?;
    if db::assets::find_by_domain(&state.pool, &payload.domain)
        .await?
        .is_some()
    {
        return Err(AppError::conflict(format!(
            "asset {} already exists",
            payload.domain
        )));
    }

    let asset = db::assets::insert(&state.pool, payload).await?;
    db::audit::record(
        &state.pool,
        "create_asset",
        &user.actor(),
        format!("asset_id={} domain={}", asset.id, asset.domain),
    )
    .await;
    Ok((StatusCode::CREATED, Json(asset)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AssetQuery>,
) -> AppResult<Json<Page<Asset>>> {
    let skip = query.skip.unwrap_or(0).max(0);
    let take = query.take.unwrap_or(DEFAULT_TAKE).clamp(1, MAX_TAKE);
    let (data, total) = db::assets::list(&state.pool, &query, skip, take).await?;
    Ok(Json(Page {
        data,
        meta: PageMeta { total, skip, take },
    }))
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<AssetStats>> {
    Ok(Json(db::assets::stats(&state.pool).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Asset>> {
    let asset = db::assets::find(&state.pool, id)
        .await?
        .ok_or(ScanError::AssetNotFound(id))?;
    Ok(Json(asset))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(mut changes): Json<AssetUpdate>,
) -> AppResult<Json<Asset>> {
    user.require(&[Role::Admin, Role::Analyst])?;

    if changes.risk_score.is_some_and(|score| !score.is_finite() || score < 0.0) {
        return Err(AppError::bad_request("riskScore must be a non-negative number"));
    }
    if let Some(domain) = changes.domain.as_mut() {
        *domain = domain.trim().to_string();
        validate_target(domain)?;
        let taken = db::assets::find_by_domain(&state.pool, domain)
            .await?
            .is_some_and(|other| other.id != id);
        if taken {
            return Err(AppError::conflict(format!("asset {domain} already exists")));
        }
    }

    let asset = db::assets::update(&state.pool, id, changes)
        .await?
        .ok_or(ScanError::AssetNotFound(id))?;
    db::audit::record(&state.pool, "update_asset", &user.actor(), format!("asset_id={id}")).await;
    Ok(Json(asset))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    user.require(&[Role::Admin])?;
    state.orchestrator.delete_asset(id, &user.actor()).await?;
    Ok(deleted("Asset"))
}
