//! Row-level representations of the persisted entities.

use crate::types::{ChatId, JobId, MessageId, ProblemId, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Chat {
    pub id: ChatId,
    pub client_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Problem {
    pub id: ProblemId,
    pub chat_id: ChatId,
    pub manager_id: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub problem_id: ProblemId,
    /// `None` for service messages.
    pub author_id: Option<UserId>,
    pub initial_request_id: RequestId,
    pub body: String,
    pub is_visible_for_client: bool,
    pub is_visible_for_manager: bool,
    pub is_blocked: bool,
    pub is_service: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A job leased by `find_and_reserve_job`; carries only what the worker
/// loop needs. The full row (lease and schedule timestamps) stays in the
/// database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReservedJob {
    pub id: JobId,
    pub name: String,
    pub payload: String,
    pub attempts: i32,
}
