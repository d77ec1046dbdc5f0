use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::{types::Json, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{Asset, AssetQuery, AssetStats, AssetUpdate, NewAsset};

pub async fn insert(pool: &SqlitePool, new: NewAsset) -> Result<Asset, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, Asset>(
        "INSERT INTO assets(id, domain, ip_address, ip_owner, asset_type, status, risk_score, metadata, \
         first_seen_at, last_seen_at, created_at, updated_at) \
         VALUES(?, ?, ?, ?, ?, 'ACTIVE', 0, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.domain.trim())
    .bind(new.ip_address)
    .bind(new.ip_owner)
    .bind(new.asset_type.unwrap_or_default())
    .bind(new.metadata.map(Json))
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub async fn find(pool: &SqlitePool, id: Uuid) -> Result<Option<Asset>, sqlx::Error> {
    sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_domain(pool: &SqlitePool, domain: &str) -> Result<Option<Asset>, sqlx::Error> {
    sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE domain = ? COLLATE NOCASE LIMIT 1")
        .bind(domain.trim())
        .fetch_optional(pool)
        .await
}

fn push_search(qb: &mut QueryBuilder<'_, Sqlite>, search: Option<&str>) {
    if let Some(term) = search.map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{term}%");
        qb.push(" WHERE (domain LIKE ")
            .push_bind(pattern.clone())
            .push(" OR ip_address LIKE ")
            .push_bind(pattern.clone())
            .push(" OR ip_owner LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

pub async fn list(
    pool: &SqlitePool,
    query: &AssetQuery,
    skip: i64,
    take: i64,
) -> Result<(Vec<Asset>, i64), sqlx::Error> {
    let order_by = query.order_by.unwrap_or_default();
    let order = query.order.unwrap_or_default();

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM assets");
    push_search(&mut qb, query.search.as_deref());
    qb.push(format!(
        " ORDER BY {} {dir}, rowid {dir} LIMIT ",
        order_by.column(),
        dir = order.keyword(),
    ))
    .push_bind(take)
    .push(" OFFSET ")
    .push_bind(skip);
    let rows = qb.build_query_as::<Asset>().fetch_all(pool).await?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM assets");
    push_search(&mut count, query.search.as_deref());
    let total: i64 = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok((rows, total))
}

/// Applies the provided fields and refreshes `last_seen_at`.
pub async fn update(
    pool: &SqlitePool,
    id: Uuid,
    changes: AssetUpdate,
) -> Result<Option<Asset>, sqlx::Error> {
    let now = Utc::now();
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE assets SET last_seen_at = ");
    qb.push_bind(now).push(", updated_at = ").push_bind(now);

    if let Some(domain) = changes.domain {
        qb.push(", domain = ").push_bind(domain.trim().to_string());
    }
    if let Some(ip) = changes.ip_address {
        qb.push(", ip_address = ").push_bind(ip);
    }
    if let Some(owner) = changes.ip_owner {
        qb.push(", ip_owner = ").push_bind(owner);
    }
    if let Some(asset_type) = changes.asset_type {
        qb.push(", asset_type = ").push_bind(asset_type);
    }
    if let Some(status) = changes.status {
        qb.push(", status = ").push_bind(status);
    }
    if let Some(score) = changes.risk_score {
        qb.push(", risk_score = ").push_bind(score);
    }
    if let Some(metadata) = changes.metadata {
        qb.push(", metadata = ").push_bind(Json(metadata));
    }

    qb.push(" WHERE id = ").push_bind(id).push(" RETURNING *");
    qb.build_query_as::<Asset>().fetch_optional(pool).await
}

pub async fn touch_last_seen(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE assets SET last_seen_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deletes the asset; scans and their result rows go with it.
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM assets WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn stats(pool: &SqlitePool) -> Result<AssetStats, sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets")
        .fetch_one(pool)
        .await?;
    let by_status: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM assets GROUP BY status")
            .fetch_all(pool)
            .await?;
    let avg_risk_score: f64 = sqlx::query_scalar("SELECT COALESCE(AVG(risk_score), 0.0) FROM assets")
        .fetch_one(pool)
        .await?;

    Ok(AssetStats {
        total,
        by_status: by_status.into_iter().collect::<BTreeMap<_, _>>(),
        avg_risk_score,
    })
}
