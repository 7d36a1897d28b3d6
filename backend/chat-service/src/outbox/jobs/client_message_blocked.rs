//! Tells the author that the anti-fraud check rejected the message.

use super::{marshal_message_id, unmarshal_message_id};
use crate::error::{AppError, AppResult};
use crate::outbox::JobHandler;
use crate::repositories::messages;
use crate::services::event_stream::{ChatEvent, EventStream, MessageBlockedEvent};
use crate::store::Store;
use crate::types::{EventId, MessageId};
use async_trait::async_trait;

pub const NAME: &str = "client-message-blocked";

pub fn marshal_payload(message_id: MessageId) -> AppResult<String> {
    marshal_message_id(message_id)
}

pub struct ClientMessageBlockedJob {
    store: Store,
    event_stream: EventStream,
}

impl ClientMessageBlockedJob {
    pub fn new(store: Store, event_stream: EventStream) -> Self {
        Self { store, event_stream }
    }
}

#[async_trait]
impl JobHandler for ClientMessageBlockedJob {
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

        let event = ChatEvent::MessageBlocked(MessageBlockedEvent {
            event_id: EventId::new(),
            request_id: msg.initial_request_id,
            message_id: msg.id,
        });
        if let Err(e) = self.event_stream.publish(author_id, event).await {
            tracing::warn!(message_id = %msg.id, error = %e, "publish MessageBlockedEvent");
        }

        Ok(())
    }
}
