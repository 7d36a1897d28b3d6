//! Pushes a manager message to the bus and notifies both chat sides.

use super::{marshal_message_id, unmarshal_message_id};
use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::outbox::JobHandler;
use crate::repositories::{chats, messages};
use crate::services::event_stream::{ChatEvent, EventStream, NewMessageEvent};
use crate::services::msg_producer::{BusMessage, MessageProducer};
use crate::store::Store;
use crate::types::{EventId, MessageId, UserId};
use async_trait::async_trait;
use std::sync::Arc;

pub const NAME: &str = "send-manager-message";

pub fn marshal_payload(message_id: MessageId) -> AppResult<String> {
    marshal_message_id(message_id)
}

pub struct SendManagerMessageJob {
    store: Store,
    producer: Arc<MessageProducer>,
    event_stream: EventStream,
}

impl SendManagerMessageJob {
    pub fn new(store: Store, producer: Arc<MessageProducer>, event_stream: EventStream) -> Self {
        Self {
            store,
            producer,
            event_stream,
        }
    }

    async fn publish_new_message_event(&self, msg: &Message, recipient: UserId) {
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

        if let Err(e) = self.event_stream.publish(recipient, event).await {
            tracing::warn!(message_id = %msg.id, recipient = %recipient, error = %e, "publish NewMessageEvent");
        }
    }
}

#[async_trait]
impl JobHandler for SendManagerMessageJob {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, payload: &str) -> AppResult<()> {
        let message_id = unmarshal_message_id(payload)?;

        let (msg, client_id) = {
            let mut conn = self.store.acquire().await?;
            let msg = messages::get_message_by_id(&mut conn, message_id).await?;
            let client_id = chats::get_client_id_by_chat_id(&mut conn, msg.chat_id).await?;
            (msg, client_id)
        };

        let manager_id = msg
            .author_id
            .ok_or_else(|| AppError::Payload("manager message without author".into()))?;

        self.producer
            .produce(BusMessage {
                id: msg.id,
                chat_id: msg.chat_id,
                body: msg.body.clone(),
                from_client: false,
            })
            .await?;

        tokio::join!(
            self.publish_new_message_event(&msg, manager_id),
            self.publish_new_message_event(&msg, client_id),
        );

        Ok(())
    }
}
