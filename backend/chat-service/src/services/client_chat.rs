//! Client-side use-cases: send a message, page through the chat history.

use crate::cursor::{self, Cursor};
use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::outbox::jobs::send_client_message;
use crate::outbox::OutboxService;
use crate::repositories::{chats, messages, problems};
use crate::store::Store;
use crate::types::{MessageId, RequestId, UserId};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::sync::Arc;

pub const MAX_MESSAGE_BODY_LEN: usize = 3000;

#[derive(Debug, Clone)]
pub struct SendMessageResult {
    pub message_id: MessageId,
    pub author_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ClientChatService {
    store: Store,
    outbox: Arc<OutboxService>,
}

impl ClientChatService {
    pub fn new(store: Store, outbox: Arc<OutboxService>) -> Self {
        Self { store, outbox }
    }

    /// The canonical send path: one transaction ensures the chat, ensures
    /// the open problem, writes the client-visible message and enqueues the
    /// bus publication. `request_id` de-duplicates: a repeated request
    /// returns the first message untouched.
    pub async fn send_message(
        &self,
        client_id: UserId,
        request_id: RequestId,
        body: String,
    ) -> AppResult<SendMessageResult> {
        validate_message_body(&body)?;
        if request_id.is_nil() {
            return Err(AppError::Validation("request id is required".into()));
        }

        let outbox = Arc::clone(&self.outbox);
        let msg = self
            .store
            .run_in_tx(move |conn: &mut PgConnection| {
                let outbox = Arc::clone(&outbox);
                let body = body.clone();
                Box::pin(async move {
                    if let Some(existing) =
                        messages::get_message_by_request_id(conn, request_id).await?
                    {
                        return Ok(existing);
                    }

                    let chat_id = chats::create_if_not_exists(conn, client_id)
                        .await
                        .map_err(as_chat_not_created)?;
                    let problem_id = problems::create_if_not_exists(conn, chat_id)
                        .await
                        .map_err(as_problem_not_created)?;

                    let msg = messages::create_client_visible(
                        conn, request_id, problem_id, chat_id, client_id, &body,
                    )
                    .await?;

                    let payload = send_client_message::marshal_payload(msg.id)?;
                    outbox
                        .put(conn, send_client_message::NAME, &payload, Utc::now())
                        .await?;

                    Ok(msg)
                })
            })
            .await?;

        Ok(SendMessageResult {
            message_id: msg.id,
            author_id: msg.author_id,
            created_at: msg.created_at,
        })
    }

    pub async fn get_history(
        &self,
        client_id: UserId,
        page_size: i64,
        cursor: Option<&str>,
    ) -> AppResult<(Vec<Message>, Option<String>)> {
        let cursor: Option<Cursor> = cursor.map(cursor::decode).transpose()?;

        let mut conn = self.store.acquire().await?;
        let (messages, next) =
            messages::get_client_chat_messages(&mut conn, client_id, page_size, cursor).await?;

        let next = next.map(|c| cursor::encode(&c)).transpose()?;

        Ok((messages, next))
    }
}

pub(crate) fn validate_message_body(body: &str) -> AppResult<()> {
    if body.is_empty() || body.chars().count() > MAX_MESSAGE_BODY_LEN {
        return Err(AppError::Validation(format!(
            "message body must be 1..={MAX_MESSAGE_BODY_LEN} characters"
        )));
    }
    Ok(())
}

fn as_chat_not_created(err: AppError) -> AppError {
    match err {
        AppError::Database(e) => AppError::ChatNotCreated(e),
        other => other,
    }
}

fn as_problem_not_created(err: AppError) -> AppError {
    match err {
        AppError::Database(e) => AppError::ProblemNotCreated(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_bounds() {
        assert!(validate_message_body("hi").is_ok());
        assert!(validate_message_body(&"a".repeat(MAX_MESSAGE_BODY_LEN)).is_ok());
        assert!(validate_message_body("").is_err());
        assert!(validate_message_body(&"a".repeat(MAX_MESSAGE_BODY_LEN + 1)).is_err());
    }

    #[test]
    fn chat_creation_failures_get_the_stable_code() {
        let err = as_chat_not_created(AppError::Database(sqlx::Error::PoolClosed));
        assert_eq!(err.code(), crate::error::CODE_CREATE_CHAT_ERROR);

        let err = as_problem_not_created(AppError::Database(sqlx::Error::PoolClosed));
        assert_eq!(err.code(), crate::error::CODE_CREATE_PROBLEM_ERROR);
    }
}
