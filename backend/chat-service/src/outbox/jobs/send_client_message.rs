//! Pushes a freshly written client message to the anti-fraud bus and tells
//! the author's sockets about it.

use super::{marshal_message_id, unmarshal_message_id};
use crate::error::{AppError, AppResult};
use crate::outbox::JobHandler;
use crate::repositories::messages;
use crate::services::event_stream::{ChatEvent, EventStream, NewMessageEvent};
use crate::services::msg_producer::{BusMessage, MessageProducer};
use crate::store::Store;
use crate::types::{EventId, MessageId};
use async_trait::async_trait;
use std::sync::Arc;

pub const NAME: &str = "send-client-message";

pub fn marshal_payload(message_id: MessageId) -> AppResult<String> {
    marshal_message_id(message_id)
}

pub struct SendClientMessageJob {
    store: Store,
    producer: Arc<MessageProducer>,
    event_stream: EventStream,
}

impl SendClientMessageJob {
    pub fn new(store: Store, producer: Arc<MessageProducer>, event_stream: EventStream) -> Self {
        Self {
            store,
            producer,
            event_stream,
        }
    }
}

#[async_trait]
impl JobHandler for SendClientMessageJob {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, payload: &str) -> AppResult<()> {
        let message_id = unmarshal_message_id(payload)?;

        let msg = {
            let mut conn = self.store.acquire().await?;
            messages::get_message_by_id(&mut conn, message_id).await?
        };

        let author_id = msg
            .author_id
            .ok_or_else(|| AppError::Payload("client message without author".into()))?;

        self.producer
            .produce(BusMessage {
                id: msg.id,
                chat_id: msg.chat_id,
                body: msg.body.clone(),
                from_client: true,
            })
            .await?;

        let event = ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: msg.initial_request_id,
            chat_id: msg.chat_id,
            message_id: msg.id,
            author_id: Some(author_id),
            created_at: msg.created_at,
            body: msg.body,
            is_service: msg.is_service,
        });
        if let Err(e) = self.event_stream.publish(author_id, event).await {
            tracing::warn!(message_id = %msg.id, error = %e, "publish NewMessageEvent");
        }

        Ok(())
    }
}
