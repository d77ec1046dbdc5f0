//! Queries over `scans` and `scan_results`.
//!
//! Every status write is guarded by the state it expects to leave, so a
//! terminal status is never overwritten no matter which path gets there
//! first (worker completion, worker failure, cancel).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{
    jobs::format_elapsed,
    models::{ScanFilter, ScanJob, ScanListRow, ScanResult, ScanStatus, ToolType},
};

const LIST_SELECT: &str = "SELECT s.*, a.domain AS asset_domain, \
     (SELECT COUNT(*) FROM scan_results r WHERE r.scan_id = s.id) AS result_count \
     FROM scans s JOIN assets a ON a.id = s.asset_id";

/// Rows per multi-value INSERT; keeps well under SQLite's bind limit.
const RESULT_BATCH: usize = 500;

pub async fn insert_pending(
    pool: &SqlitePool,
    asset_id: Uuid,
    tool: ToolType,
) -> Result<ScanJob, sqlx::Error> {
    sqlx::query_as::<_, ScanJob>(
        "INSERT INTO scans(id, asset_id, tool_type, status, created_at) \
         VALUES(?, ?, ?, 'PENDING', ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(asset_id)
    .bind(tool)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
}

pub async fn find(pool: &SqlitePool, id: Uuid) -> Result<Option<ScanJob>, sqlx::Error> {
    sqlx::query_as::<_, ScanJob>("SELECT * FROM scans WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ScanFilter) {
    let mut sep = " WHERE ";
    if let Some(asset_id) = filter.asset_id {
        qb.push(sep).push("s.asset_id = ").push_bind(asset_id);
        sep = " AND ";
    }
    if let Some(tool) = filter.tool_type {
        qb.push(sep).push("s.tool_type = ").push_bind(tool);
        sep = " AND ";
    }
    if let Some(status) = filter.status {
        qb.push(sep).push("s.status = ").push_bind(status);
    }
}

/// One page of jobs, newest first, plus the total matching count.
pub async fn list(
    pool: &SqlitePool,
    filter: &ScanFilter,
    skip: i64,
    take: i64,
) -> Result<(Vec<ScanListRow>, i64), sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new(LIST_SELECT);
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY s.created_at DESC, s.rowid DESC LIMIT ")
        .push_bind(take)
        .push(" OFFSET ")
        .push_bind(skip);
    let rows = qb.build_query_as::<ScanListRow>().fetch_all(pool).await?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM scans s");
    push_filters(&mut count, filter);
    let total = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok((rows, total))
}

pub async fn list_for_asset(pool: &SqlitePool, asset_id: Uuid) -> Result<Vec<ScanListRow>, sqlx::Error> {
    let sql = format!("{LIST_SELECT} WHERE s.asset_id = ? ORDER BY s.created_at DESC, s.rowid DESC");
    sqlx::query_as::<_, ScanListRow>(&sql)
        .bind(asset_id)
        .fetch_all(pool)
        .await
}

pub async fn results_for(pool: &SqlitePool, scan_id: Uuid) -> Result<Vec<ScanResult>, sqlx::Error> {
    sqlx::query_as::<_, ScanResult>(
        "SELECT * FROM scan_results WHERE scan_id = ? ORDER BY created_at ASC, line_number ASC",
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await
}

/// `PENDING -> RUNNING`. Returns false if the job is gone or no longer pending.
pub async fn mark_running(
    pool: &SqlitePool,
    id: Uuid,
    command: &str,
    started_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE scans SET status = 'RUNNING', command = ?, started_at = ? \
         WHERE id = ? AND status = 'PENDING'",
    )
    .bind(command)
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub stdout: String,
    pub stderr: Option<String>,
    pub execution_time: String,
}

/// `RUNNING -> COMPLETED` together with the parsed result rows, in one
/// transaction. Returns false (and writes nothing) if the job left
/// `RUNNING` in the meantime.
pub async fn complete_with_results(
    pool: &SqlitePool,
    id: Uuid,
    completion: &Completion,
    result_type: &str,
    rows: Vec<Value>,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let res = sqlx::query(
        "UPDATE scans SET status = 'COMPLETED', stdout = ?, stderr = ?, execution_time = ?, completed_at = ? \
         WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(&completion.stdout)
    .bind(&completion.stderr)
    .bind(&completion.execution_time)
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    let numbered: Vec<(i64, Value)> = rows
        .into_iter()
        .enumerate()
        .map(|(i, v)| (i as i64 + 1, v))
        .collect();
    for chunk in numbered.chunks(RESULT_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO scan_results(id, scan_id, result_type, data, line_number, created_at) ",
        );
        qb.push_values(chunk, |mut b, (line, data)| {
            b.push_bind(Uuid::new_v4())
                .push_bind(id)
                .push_bind(result_type.to_string())
                .push_bind(Json(data.clone()))
                .push_bind(*line)
                .push_bind(now);
        });
        qb.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// `RUNNING -> FAILED`, keeping whatever stdout was captured.
pub async fn mark_failed(
    pool: &SqlitePool,
    id: Uuid,
    stdout: Option<&str>,
    stderr: &str,
    execution_time: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE scans SET status = 'FAILED', stdout = ?, stderr = ?, execution_time = ?, completed_at = ? \
         WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(stdout)
    .bind(stderr)
    .bind(execution_time)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `PENDING | RUNNING -> CANCELLED`.
pub async fn mark_cancelled(pool: &SqlitePool, id: Uuid) -> Result<Option<ScanJob>, sqlx::Error> {
    sqlx::query_as::<_, ScanJob>(
        "UPDATE scans SET status = 'CANCELLED', completed_at = ? \
         WHERE id = ? AND status IN ('PENDING', 'RUNNING') RETURNING *",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Fails every job left `RUNNING` by a previous process. The recorded
/// execution time runs from `started_at` to now, the last moment the
/// process could still have been alive.
pub async fn fail_running(pool: &SqlitePool, message: &str) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let running: Vec<(Uuid, Option<DateTime<Utc>>)> =
        sqlx::query_as("SELECT id, started_at FROM scans WHERE status = 'RUNNING'")
            .fetch_all(&mut *tx)
            .await?;

    let mut failed = 0;
    for (id, started_at) in running {
        let elapsed = started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or_default();
        let res = sqlx::query(
            "UPDATE scans SET status = 'FAILED', stderr = ?, execution_time = ?, completed_at = ? \
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(message)
        .bind(format_elapsed(elapsed))
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        failed += res.rows_affected();
    }

    tx.commit().await?;
    Ok(failed)
}

/// `(scan id, tool, asset domain)` for every queued job, oldest first.
pub async fn pending_targets(pool: &SqlitePool) -> Result<Vec<(Uuid, ToolType, String)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT s.id, s.tool_type, a.domain FROM scans s JOIN assets a ON a.id = s.asset_id \
         WHERE s.status = 'PENDING' ORDER BY s.created_at ASC, s.rowid ASC",
    )
    .fetch_all(pool)
    .await
}

/// Removes the job; its result rows follow by cascade.
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM scans WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_results(pool: &SqlitePool, scan_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM scan_results WHERE scan_id = ?")
        .bind(scan_id)
        .fetch_one(pool)
        .await
}

pub async fn status_of(pool: &SqlitePool, id: Uuid) -> Result<Option<ScanStatus>, sqlx::Error> {
    sqlx::query_scalar("SELECT status FROM scans WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}
