//! Announces a fresh assignment: the manager gets a `NewChatEvent`, the
//! client gets the "you have a manager" service message.

use crate::error::{AppError, AppResult};
use crate::outbox::JobHandler;
use crate::repositories::messages;
use crate::services::event_stream::{ChatEvent, EventStream, NewChatEvent, NewMessageEvent};
use crate::services::manager_load::ManagerLoadService;
use crate::store::Store;
use crate::types::{EventId, MessageId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NAME: &str = "manager-assigned-to-problem";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub message_id: MessageId,
    pub manager_id: UserId,
    pub client_id: UserId,
}

impl Payload {
    fn validate(&self) -> AppResult<()> {
        if self.message_id.is_nil() || self.manager_id.is_nil() || self.client_id.is_nil() {
            return Err(AppError::Payload("nil identifier in payload".into()));
        }
        Ok(())
    }
}

pub fn marshal_payload(payload: &Payload) -> AppResult<String> {
    payload.validate()?;
    serde_json::to_string(payload).map_err(|e| AppError::Payload(e.to_string()))
}

pub fn unmarshal_payload(payload: &str) -> AppResult<Payload> {
    let parsed: Payload =
        serde_json::from_str(payload).map_err(|e| AppError::Payload(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

pub struct ManagerAssignedToProblemJob {
    store: Store,
    manager_load: Arc<ManagerLoadService>,
    event_stream: EventStream,
}

impl ManagerAssignedToProblemJob {
    pub fn new(
        store: Store,
        manager_load: Arc<ManagerLoadService>,
        event_stream: EventStream,
    ) -> Self {
        Self {
            store,
            manager_load,
            event_stream,
        }
    }
}

#[async_trait]
impl JobHandler for ManagerAssignedToProblemJob {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, payload: &str) -> AppResult<()> {
        let pl = unmarshal_payload(payload)?;

        let msg = {
            let mut conn = self.store.acquire().await?;
            messages::get_message_by_id(&mut conn, pl.message_id).await?
        };

        let can_take_more = self
            .manager_load
            .can_manager_take_problem(pl.manager_id)
            .await?;

        let new_chat = ChatEvent::NewChat(NewChatEvent {
            event_id: EventId::new(),
            chat_id: msg.chat_id,
            client_id: pl.client_id,
            request_id: msg.initial_request_id,
            can_take_more_problems: can_take_more,
        });
        if let Err(e) = self.event_stream.publish(pl.manager_id, new_chat).await {
            tracing::warn!(manager_id = %pl.manager_id, error = %e, "publish NewChatEvent");
        }

        let new_message = ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: msg.initial_request_id,
            chat_id: msg.chat_id,
            message_id: msg.id,
            author_id: msg.author_id,
            created_at: msg.created_at,
            body: msg.body,
            is_service: msg.is_service,
        });
        if let Err(e) = self.event_stream.publish(pl.client_id, new_message).await {
            tracing::warn!(client_id = %pl.client_id, error = %e, "publish NewMessageEvent");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn payload_round_trips() {
        let payload = Payload {
            message_id: MessageId::new(),
            manager_id: UserId::new(),
            client_id: UserId::new(),
        };

        let raw = marshal_payload(&payload).unwrap();
        assert_eq!(unmarshal_payload(&raw).unwrap(), payload);
    }

    #[test]
    fn payload_uses_camel_case_keys() {
        let payload = Payload {
            message_id: MessageId::new(),
            manager_id: UserId::new(),
            client_id: UserId::new(),
        };

        let value: serde_json::Value =
            serde_json::from_str(&marshal_payload(&payload).unwrap()).unwrap();
        assert!(value.get("messageId").is_some());
        assert!(value.get("managerId").is_some());
        assert!(value.get("clientId").is_some());
    }

    #[test]
    fn nil_ids_are_rejected() {
        let payload = Payload {
            message_id: MessageId::from_uuid(Uuid::nil()),
            manager_id: UserId::new(),
            client_id: UserId::new(),
        };

        assert!(marshal_payload(&payload).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(unmarshal_payload("{\"nope\":1}").is_err());
        assert!(unmarshal_payload("not json").is_err());
    }
}
