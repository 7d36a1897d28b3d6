//! Manager-side use-cases: readiness signaling, chat listing and history,
//! replying, closing.

use crate::cursor::{self, Cursor};
use crate::error::{AppError, AppResult};
use crate::models::{Chat, Message};
use crate::outbox::jobs::{close_chat, send_manager_message};
use crate::outbox::OutboxService;
use crate::repositories::{chats, messages, problems};
use crate::services::client_chat::validate_message_body;
use crate::services::manager_load::ManagerLoadService;
use crate::services::manager_pool::ManagerPool;
use crate::store::Store;
use crate::types::{ChatId, RequestId, UserId};
use chrono::Utc;
use sqlx::PgConnection;
use std::sync::Arc;

pub const PROBLEM_RESOLVED_MSG_TEXT: &str =
    "Your question has been marked as resolved.\nThank you for being with us!";

#[derive(Clone)]
pub struct ManagerChatService {
    store: Store,
    outbox: Arc<OutboxService>,
    pool: Arc<ManagerPool>,
    load: Arc<ManagerLoadService>,
}

impl ManagerChatService {
    pub fn new(
        store: Store,
        outbox: Arc<OutboxService>,
        pool: Arc<ManagerPool>,
        load: Arc<ManagerLoadService>,
    ) -> Self {
        Self {
            store,
            outbox,
            pool,
            load,
        }
    }

    /// The manager signals readiness for new problems. An overloaded manager
    /// is rejected with a stable code instead of silently queueing.
    pub async fn free_hands(&self, manager_id: UserId) -> AppResult<()> {
        if !self.load.can_manager_take_problem(manager_id).await? {
            return Err(AppError::ManagerOverloaded);
        }

        self.pool.put(manager_id)
    }

    /// Whether showing the free-hands button makes sense: false while the
    /// manager already waits in the pool or sits at the problem cap.
    pub async fn can_receive_problems(&self, manager_id: UserId) -> AppResult<bool> {
        if self.pool.contains(manager_id) {
            return Ok(false);
        }

        self.load.can_manager_take_problem(manager_id).await
    }

    pub async fn get_chats(&self, manager_id: UserId) -> AppResult<Vec<Chat>> {
        let mut conn = self.store.acquire().await?;
        chats::get_open_problem_chats_for_manager(&mut conn, manager_id).await
    }

    pub async fn get_chat_history(
        &self,
        manager_id: UserId,
        chat_id: ChatId,
        page_size: i64,
        cursor: Option<&str>,
    ) -> AppResult<(Vec<Message>, Option<String>)> {
        let cursor: Option<Cursor> = cursor.map(cursor::decode).transpose()?;

        let mut conn = self.store.acquire().await?;
        let problem =
            problems::get_assigned_unresolved_problem(&mut conn, chat_id, manager_id).await?;
        let (messages, next) =
            messages::get_problem_messages(&mut conn, problem.id, page_size, cursor).await?;

        let next = next.map(|c| cursor::encode(&c)).transpose()?;

        Ok((messages, next))
    }

    /// A manager reply: immediately visible to both sides, no anti-fraud
    /// round-trip. Idempotent by request id like the client path.
    pub async fn send_message(
        &self,
        manager_id: UserId,
        chat_id: ChatId,
        request_id: RequestId,
        body: String,
    ) -> AppResult<Message> {
        validate_message_body(&body)?;
        if request_id.is_nil() {
            return Err(AppError::Validation("request id is required".into()));
        }

        let outbox = Arc::clone(&self.outbox);
        self.store
            .run_in_tx(move |conn: &mut PgConnection| {
                let outbox = Arc::clone(&outbox);
                let body = body.clone();
                Box::pin(async move {
                    if let Some(existing) =
                        messages::get_message_by_request_id(conn, request_id).await?
                    {
                        return Ok(existing);
                    }

                    let problem =
                        problems::get_assigned_unresolved_problem(conn, chat_id, manager_id)
                            .await
                            .map_err(as_no_active_problem)?;

                    let msg = messages::create_full_visible(
                        conn, request_id, problem.id, chat_id, manager_id, &body,
                    )
                    .await?;

                    let payload = send_manager_message::marshal_payload(msg.id)?;
                    outbox
                        .put(conn, send_manager_message::NAME, &payload, Utc::now())
                        .await?;

                    Ok(msg)
                })
            })
            .await
    }

    /// Resolves the manager's problem in the chat, writes the closing
    /// service message and enqueues the notification fan-out, atomically.
    pub async fn close_chat(
        &self,
        manager_id: UserId,
        chat_id: ChatId,
        request_id: RequestId,
    ) -> AppResult<()> {
        if request_id.is_nil() {
            return Err(AppError::Validation("request id is required".into()));
        }

        let client_id = {
            let mut conn = self.store.acquire().await?;
            chats::get_client_id_by_chat_id(&mut conn, chat_id).await?
        };

        let outbox = Arc::clone(&self.outbox);
        self.store
            .run_in_tx(move |conn: &mut PgConnection| {
                let outbox = Arc::clone(&outbox);
                Box::pin(async move {
                    let problem = problems::resolve_assigned_problem(conn, chat_id, manager_id)
                        .await
                        .map_err(as_no_active_problem)?;

                    let msg = messages::create_service_client_visible(
                        conn,
                        request_id,
                        problem.id,
                        chat_id,
                        PROBLEM_RESOLVED_MSG_TEXT,
                    )
                    .await?;

                    let payload = close_chat::marshal_payload(&close_chat::Payload {
                        request_id,
                        manager_id,
                        message_id: msg.id,
                        client_id,
                    })?;
                    outbox
                        .put(conn, close_chat::NAME, &payload, Utc::now())
                        .await?;

                    Ok(())
                })
            })
            .await
    }
}

fn as_no_active_problem(err: AppError) -> AppError {
    match err {
        AppError::NotFound(_) => AppError::NoActiveProblemInChat,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_problem_maps_to_the_stable_code() {
        let err = as_no_active_problem(AppError::NotFound("problem"));
        assert_eq!(err.code(), crate::error::CODE_NO_ACTIVE_PROBLEM_IN_CHAT);

        // Other errors pass through untouched.
        assert!(matches!(
            as_no_active_problem(AppError::Database(sqlx::Error::PoolClosed)),
            AppError::Database(_)
        ));
    }
}
