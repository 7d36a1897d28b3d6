use crate::error::AppResult;
use crate::models::ReservedJob;
use crate::types::{FailedJobId, JobId};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

pub async fn create_job(
    conn: &mut PgConnection,
    name: &str,
    payload: &str,
    available_at: DateTime<Utc>,
) -> AppResult<JobId> {
    let id: JobId = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (id, name, payload, available_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(JobId::new())
    .bind(name)
    .bind(payload)
    .bind(available_at)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// Atomically leases the stalest runnable job: bumps its `reserved_until`
/// and `attempts` in the same statement that picks it. `FOR UPDATE SKIP
/// LOCKED` keeps concurrent workers on disjoint rows.
pub async fn find_and_reserve_job(
    conn: &mut PgConnection,
    until: DateTime<Utc>,
) -> AppResult<Option<ReservedJob>> {
    let job = sqlx::query_as::<_, ReservedJob>(
        r#"
        UPDATE jobs
        SET reserved_until = $1, attempts = attempts + 1
        WHERE id = (
            SELECT id
            FROM jobs
            WHERE available_at < NOW() AND reserved_until < NOW()
            ORDER BY reserved_until ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, name, payload, attempts
        "#,
    )
    .bind(until)
    .fetch_optional(conn)
    .await?;

    Ok(job)
}

pub async fn create_failed_job(
    conn: &mut PgConnection,
    name: &str,
    payload: &str,
    reason: &str,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO failed_jobs (id, name, payload, reason)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(FailedJobId::new())
    .bind(name)
    .bind(payload)
    .bind(reason)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn delete_job(conn: &mut PgConnection, job_id: JobId) -> AppResult<()> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(conn)
        .await?;

    Ok(())
}
