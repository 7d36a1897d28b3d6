//! Fans out the chat-closed notifications: `ChatClosedEvent` to the manager,
//! the closing service message to the client, concurrently.

use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::outbox::JobHandler;
use crate::repositories::messages;
use crate::services::event_stream::{ChatEvent, ChatClosedEvent, EventStream, NewMessageEvent};
use crate::store::Store;
use crate::types::{EventId, MessageId, RequestId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const NAME: &str = "close-chat";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub request_id: RequestId,
    pub manager_id: UserId,
    pub message_id: MessageId,
    pub client_id: UserId,
}

impl Payload {
    fn validate(&self) -> AppResult<()> {
        if self.request_id.is_nil()
            || self.manager_id.is_nil()
            || self.message_id.is_nil()
            || self.client_id.is_nil()
        {
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

pub struct CloseChatJob {
    store: Store,
    event_stream: EventStream,
}

impl CloseChatJob {
    pub fn new(store: Store, event_stream: EventStream) -> Self {
        Self { store, event_stream }
    }

    async fn publish_chat_closed(&self, msg: &Message, pl: &Payload) {
        let event = ChatEvent::ChatClosed(ChatClosedEvent {
            event_id: EventId::new(),
            chat_id: msg.chat_id,
            request_id: pl.request_id,
            can_take_more_problems: true,
        });

        if let Err(e) = self.event_stream.publish(pl.manager_id, event).await {
            tracing::warn!(manager_id = %pl.manager_id, error = %e, "publish ChatClosedEvent");
        }
    }

    async fn publish_closing_message(&self, msg: &Message, pl: &Payload) {
        let event = ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: msg.initial_request_id,
            chat_id: msg.chat_id,
            message_id: msg.id,
            author_id: msg.author_id,
            created_at: msg.created_at,
            body: msg.body.clone(),
            is_service: msg.is_service,
        });

        if let Err(e) = self.event_stream.publish(pl.client_id, event).await {
            tracing::warn!(client_id = %pl.client_id, error = %e, "publish NewMessageEvent");
        }
    }
}

#[async_trait]
impl JobHandler for CloseChatJob {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, payload: &str) -> AppResult<()> {
        let pl = unmarshal_payload(payload)?;

        let msg = {
            let mut conn = self.store.acquire().await?;
            messages::get_message_by_id(&mut conn, pl.message_id).await?
        };

        tokio::join!(
            self.publish_chat_closed(&msg, &pl),
            self.publish_closing_message(&msg, &pl),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn payload() -> Payload {
        Payload {
            request_id: RequestId::new(),
            manager_id: UserId::new(),
            message_id: MessageId::new(),
            client_id: UserId::new(),
        }
    }

    #[test]
    fn payload_round_trips() {
        let pl = payload();
        let raw = marshal_payload(&pl).unwrap();
        assert_eq!(unmarshal_payload(&raw).unwrap(), pl);
    }

    #[test]
    fn nil_request_id_is_rejected() {
        let mut pl = payload();
        pl.request_id = RequestId::from_uuid(Uuid::nil());
        assert!(marshal_payload(&pl).is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(unmarshal_payload("{\"requestId\":\"x\"}").is_err());
    }
}
