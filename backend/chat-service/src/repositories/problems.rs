use crate::error::{AppError, AppResult};
use crate::models::Problem;
use crate::types::{ChatId, ProblemId, UserId};
use sqlx::PgConnection;

/// Returns the chat's unresolved problem, creating it when absent.
///
/// The partial unique index on `(chat_id) WHERE resolved_at IS NULL` makes
/// the insert race-safe: a concurrent insert loses the conflict and the
/// winner's row is re-read.
pub async fn create_if_not_exists(
    conn: &mut PgConnection,
    chat_id: ChatId,
) -> AppResult<ProblemId> {
    if let Some(id) = find_unresolved(conn, chat_id).await? {
        return Ok(id);
    }

    let inserted: Option<ProblemId> = sqlx::query_scalar(
        r#"
        INSERT INTO problems (id, chat_id)
        VALUES ($1, $2)
        ON CONFLICT (chat_id) WHERE resolved_at IS NULL DO NOTHING
        RETURNING id
        "#,
    )
    .bind(ProblemId::new())
    .bind(chat_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        return Ok(id);
    }

    find_unresolved(conn, chat_id)
        .await?
        .ok_or(AppError::NotFound("problem"))
}

async fn find_unresolved(
    conn: &mut PgConnection,
    chat_id: ChatId,
) -> AppResult<Option<ProblemId>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM problems WHERE chat_id = $1 AND resolved_at IS NULL",
    )
    .bind(chat_id)
    .fetch_optional(conn)
    .await?;

    Ok(id)
}

/// Unresolved, unassigned problems that already have at least one message
/// the manager may see, oldest first.
pub async fn problems_without_manager(
    conn: &mut PgConnection,
    limit: i64,
) -> AppResult<Vec<ProblemId>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT p.id
        FROM problems p
        WHERE p.manager_id IS NULL
          AND p.resolved_at IS NULL
          AND EXISTS (
              SELECT 1 FROM messages m
              WHERE m.problem_id = p.id AND m.is_visible_for_manager
          )
        ORDER BY p.created_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(ids)
}

pub async fn assign_manager_to_problem(
    conn: &mut PgConnection,
    manager_id: UserId,
    problem_id: ProblemId,
) -> AppResult<Problem> {
    let problem = sqlx::query_as::<_, Problem>(
        r#"
        UPDATE problems
        SET manager_id = $1
        WHERE id = $2
        RETURNING id, chat_id, manager_id, resolved_at, created_at
        "#,
    )
    .bind(manager_id)
    .bind(problem_id)
    .fetch_optional(conn)
    .await?;

    problem.ok_or(AppError::NotFound("problem"))
}

/// Resolves the chat's unresolved problem only when it belongs to this
/// manager; NotFound otherwise.
pub async fn resolve_assigned_problem(
    conn: &mut PgConnection,
    chat_id: ChatId,
    manager_id: UserId,
) -> AppResult<Problem> {
    let problem = sqlx::query_as::<_, Problem>(
        r#"
        UPDATE problems
        SET resolved_at = NOW()
        WHERE chat_id = $1 AND manager_id = $2 AND resolved_at IS NULL
        RETURNING id, chat_id, manager_id, resolved_at, created_at
        "#,
    )
    .bind(chat_id)
    .bind(manager_id)
    .fetch_optional(conn)
    .await?;

    problem.ok_or(AppError::NotFound("problem"))
}

pub async fn get_assigned_unresolved_problem(
    conn: &mut PgConnection,
    chat_id: ChatId,
    manager_id: UserId,
) -> AppResult<Problem> {
    let problem = sqlx::query_as::<_, Problem>(
        r#"
        SELECT id, chat_id, manager_id, resolved_at, created_at
        FROM problems
        WHERE chat_id = $1 AND manager_id = $2 AND resolved_at IS NULL
        "#,
    )
    .bind(chat_id)
    .bind(manager_id)
    .fetch_optional(conn)
    .await?;

    problem.ok_or(AppError::NotFound("problem"))
}

pub async fn get_manager_open_problems_count(
    conn: &mut PgConnection,
    manager_id: UserId,
) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM problems WHERE manager_id = $1 AND resolved_at IS NULL",
    )
    .bind(manager_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}
