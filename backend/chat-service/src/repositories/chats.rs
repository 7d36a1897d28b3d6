use crate::error::{AppError, AppResult};
use crate::models::Chat;
use crate::types::{ChatId, UserId};
use sqlx::PgConnection;

/// Idempotent upsert keyed by `client_id`; always returns the chat id,
/// whether the row was just created or already existed.
pub async fn create_if_not_exists(conn: &mut PgConnection, client_id: UserId) -> AppResult<ChatId> {
    let id: ChatId = sqlx::query_scalar(
        r#"
        INSERT INTO chats (id, client_id)
        VALUES ($1, $2)
        ON CONFLICT (client_id) DO UPDATE SET client_id = EXCLUDED.client_id
        RETURNING id
        "#,
    )
    .bind(ChatId::new())
    .bind(client_id)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

pub async fn get_client_id_by_chat_id(
    conn: &mut PgConnection,
    chat_id: ChatId,
) -> AppResult<UserId> {
    let client_id: Option<UserId> = sqlx::query_scalar("SELECT client_id FROM chats WHERE id = $1")
        .bind(chat_id)
        .fetch_optional(conn)
        .await?;

    client_id.ok_or(AppError::NotFound("chat"))
}

/// Chats that currently have an unresolved problem assigned to the manager,
/// oldest first.
pub async fn get_open_problem_chats_for_manager(
    conn: &mut PgConnection,
    manager_id: UserId,
) -> AppResult<Vec<Chat>> {
    let chats = sqlx::query_as::<_, Chat>(
        r#"
        SELECT c.id, c.client_id, c.created_at
        FROM chats c
        JOIN problems p ON p.chat_id = c.id
        WHERE p.manager_id = $1 AND p.resolved_at IS NULL
        ORDER BY c.created_at ASC
        "#,
    )
    .bind(manager_id)
    .fetch_all(conn)
    .await?;

    Ok(chats)
}
