use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;

/// Appends an audit entry. Failures are logged and otherwise ignored.
pub async fn record(pool: &SqlitePool, action: &str, actor: &str, details: String) {
    let inserted = sqlx::query(
        "INSERT INTO audit_log(action, actor, details, created_at) VALUES(?, ?, ?, ?)",
    )
    .bind(action)
    .bind(actor)
    .bind(&details)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(e) = inserted {
        warn!(error = %e, action, actor, "failed to write audit entry");
    }
}
