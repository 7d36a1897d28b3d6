use crate::cursor::{is_valid_page_size, Cursor};
use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::types::{ChatId, MessageId, ProblemId, RequestId, UserId};
use sqlx::PgConnection;

const MESSAGE_COLUMNS: &str = r#"
    id, chat_id, problem_id, author_id, initial_request_id, body,
    is_visible_for_client, is_visible_for_manager, is_blocked, is_service,
    checked_at, created_at
"#;

pub async fn get_message_by_request_id(
    conn: &mut PgConnection,
    request_id: RequestId,
) -> AppResult<Option<Message>> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE initial_request_id = $1"
    ))
    .bind(request_id)
    .fetch_optional(conn)
    .await?;

    Ok(msg)
}

pub async fn get_message_by_id(
    conn: &mut PgConnection,
    message_id: MessageId,
) -> AppResult<Message> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(message_id)
    .fetch_optional(conn)
    .await?;

    msg.ok_or(AppError::NotFound("message"))
}

/// A freshly sent client message: visible to its author only until the
/// anti-fraud verdict arrives.
pub async fn create_client_visible(
    conn: &mut PgConnection,
    request_id: RequestId,
    problem_id: ProblemId,
    chat_id: ChatId,
    author_id: UserId,
    body: &str,
) -> AppResult<Message> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        r#"
        INSERT INTO messages
            (id, initial_request_id, problem_id, chat_id, author_id, body,
             is_visible_for_client, is_visible_for_manager)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, FALSE)
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(MessageId::new())
    .bind(request_id)
    .bind(problem_id)
    .bind(chat_id)
    .bind(author_id)
    .bind(body)
    .fetch_one(conn)
    .await?;

    Ok(msg)
}

/// A manager message: skips the anti-fraud pipeline, immediately visible to
/// both sides.
pub async fn create_full_visible(
    conn: &mut PgConnection,
    request_id: RequestId,
    problem_id: ProblemId,
    chat_id: ChatId,
    author_id: UserId,
    body: &str,
) -> AppResult<Message> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        r#"
        INSERT INTO messages
            (id, initial_request_id, problem_id, chat_id, author_id, body,
             is_visible_for_client, is_visible_for_manager, checked_at)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, TRUE, NOW())
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(MessageId::new())
    .bind(request_id)
    .bind(problem_id)
    .bind(chat_id)
    .bind(author_id)
    .bind(body)
    .fetch_one(conn)
    .await?;

    Ok(msg)
}

/// A service notice addressed to the client (no author).
pub async fn create_service_client_visible(
    conn: &mut PgConnection,
    request_id: RequestId,
    problem_id: ProblemId,
    chat_id: ChatId,
    body: &str,
) -> AppResult<Message> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        r#"
        INSERT INTO messages
            (id, initial_request_id, problem_id, chat_id, author_id, body,
             is_visible_for_client, is_visible_for_manager, is_service)
        VALUES ($1, $2, $3, $4, NULL, $5, TRUE, FALSE, TRUE)
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(MessageId::new())
    .bind(request_id)
    .bind(problem_id)
    .bind(chat_id)
    .bind(body)
    .fetch_one(conn)
    .await?;

    Ok(msg)
}

/// Flips manager visibility after an "ok" verdict. Monotone: repeating the
/// update is a no-op, and a blocked message stays blocked (block is
/// terminal).
pub async fn mark_as_visible_for_manager(
    conn: &mut PgConnection,
    message_id: MessageId,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET is_visible_for_manager = TRUE, checked_at = NOW()
        WHERE id = $1 AND NOT is_blocked
        "#,
    )
    .bind(message_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        ensure_message_exists(conn, message_id).await?;
    }

    Ok(())
}

/// Marks a message blocked after a "suspicious" verdict. Also withdraws
/// manager visibility so a blocked message can never be served to a manager.
pub async fn block_message(conn: &mut PgConnection, message_id: MessageId) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET is_blocked = TRUE, is_visible_for_manager = FALSE, checked_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(message_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("message"));
    }

    Ok(())
}

async fn ensure_message_exists(conn: &mut PgConnection, message_id: MessageId) -> AppResult<()> {
    let exists: Option<MessageId> = sqlx::query_scalar("SELECT id FROM messages WHERE id = $1")
        .bind(message_id)
        .fetch_optional(conn)
        .await?;

    exists.map(|_| ()).ok_or(AppError::NotFound("message"))
}

/// First manager-visible message of a problem; carries the original request
/// id and author the scheduler needs.
pub async fn get_initial_message_by_problem_id(
    conn: &mut PgConnection,
    problem_id: ProblemId,
) -> AppResult<Message> {
    let msg = sqlx::query_as::<_, Message>(&format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages
        WHERE problem_id = $1 AND is_visible_for_manager
        ORDER BY created_at ASC
        LIMIT 1
        "#
    ))
    .bind(problem_id)
    .fetch_optional(conn)
    .await?;

    msg.ok_or(AppError::NotFound("message"))
}

/// Client-side chat history: newest first, keyset-paginated. Returns the
/// page plus the cursor for the next one (None when exhausted).
pub async fn get_client_chat_messages(
    conn: &mut PgConnection,
    client_id: UserId,
    page_size: i64,
    cursor: Option<Cursor>,
) -> AppResult<(Vec<Message>, Option<Cursor>)> {
    let (page_size, last_created_at) = resolve_page(page_size, cursor)?;

    let mut messages = sqlx::query_as::<_, Message>(&format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages m
        WHERE m.chat_id = (SELECT id FROM chats WHERE client_id = $1)
          AND m.is_visible_for_client
          AND ($2::timestamptz IS NULL OR m.created_at < $2)
        ORDER BY m.created_at DESC
        LIMIT $3
        "#
    ))
    .bind(client_id)
    .bind(last_created_at)
    .bind(page_size + 1)
    .fetch_all(conn)
    .await?;

    Ok(paginate(&mut messages, page_size))
}

/// Manager-side history of one problem: manager-visible messages, newest
/// first, same cursor contract as the client history.
pub async fn get_problem_messages(
    conn: &mut PgConnection,
    problem_id: ProblemId,
    page_size: i64,
    cursor: Option<Cursor>,
) -> AppResult<(Vec<Message>, Option<Cursor>)> {
    let (page_size, last_created_at) = resolve_page(page_size, cursor)?;

    let mut messages = sqlx::query_as::<_, Message>(&format!(
        r#"
        SELECT {MESSAGE_COLUMNS}
        FROM messages m
        WHERE m.problem_id = $1
          AND m.is_visible_for_manager
          AND ($2::timestamptz IS NULL OR m.created_at < $2)
        ORDER BY m.created_at DESC
        LIMIT $3
        "#
    ))
    .bind(problem_id)
    .bind(last_created_at)
    .bind(page_size + 1)
    .fetch_all(conn)
    .await?;

    Ok(paginate(&mut messages, page_size))
}

fn resolve_page(
    page_size: i64,
    cursor: Option<Cursor>,
) -> AppResult<(i64, Option<chrono::DateTime<chrono::Utc>>)> {
    match cursor {
        Some(c) => {
            if !c.is_valid() {
                return Err(AppError::InvalidCursor);
            }
            Ok((c.page_size, Some(c.last_created_at)))
        }
        None => {
            if !is_valid_page_size(page_size) {
                return Err(AppError::InvalidPageSize);
            }
            Ok((page_size, None))
        }
    }
}

fn paginate(messages: &mut Vec<Message>, page_size: i64) -> (Vec<Message>, Option<Cursor>) {
    let has_more = messages.len() as i64 > page_size;
    if has_more {
        messages.truncate(page_size as usize);
    }

    let next = if has_more {
        messages.last().map(|m| Cursor {
            last_created_at: m.created_at,
            page_size,
        })
    } else {
        None
    };

    (std::mem::take(messages), next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(created_at: chrono::DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: ChatId::new(),
            problem_id: ProblemId::new(),
            author_id: Some(UserId::new()),
            initial_request_id: RequestId::new(),
            body: "hi".into(),
            is_visible_for_client: true,
            is_visible_for_manager: false,
            is_blocked: false,
            is_service: false,
            checked_at: None,
            created_at,
        }
    }

    #[test]
    fn resolve_page_rejects_bad_page_size_without_cursor() {
        assert!(matches!(resolve_page(9, None), Err(AppError::InvalidPageSize)));
        assert!(matches!(resolve_page(101, None), Err(AppError::InvalidPageSize)));
        assert!(resolve_page(10, None).is_ok());
    }

    #[test]
    fn resolve_page_prefers_cursor_page_size() {
        let cursor = Cursor {
            last_created_at: Utc::now(),
            page_size: 42,
        };
        let (size, last) = resolve_page(10, Some(cursor)).unwrap();
        assert_eq!(size, 42);
        assert!(last.is_some());
    }

    #[test]
    fn paginate_without_overflow_yields_no_cursor() {
        let mut page: Vec<_> = (0..10).map(|_| message(Utc::now())).collect();
        let (messages, next) = paginate(&mut page, 10);
        assert_eq!(messages.len(), 10);
        assert!(next.is_none());
    }

    #[test]
    fn paginate_with_overflow_yields_cursor_at_last_row() {
        let mut page: Vec<_> = (0..11).map(|i| {
            message(Utc::now() - chrono::Duration::seconds(i))
        }).collect();
        let (messages, next) = paginate(&mut page, 10);
        assert_eq!(messages.len(), 10);
        let next = next.unwrap();
        assert_eq!(next.page_size, 10);
        assert_eq!(next.last_created_at, messages.last().unwrap().created_at);
    }
}
