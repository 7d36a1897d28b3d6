//! Concrete outbox job handlers.
//!
//! Each module owns its payload format. Per-job payloads are deliberately
//! tiny: a message id (the durable state is re-read at execution time) or a
//! small JSON object when one id is not enough.
//!
//! Event-stream publishes inside handlers are best-effort: once the durable
//! effect succeeded, a failed socket push is logged and the job still
//! completes — clients reconnect and re-fetch.

pub mod client_message_blocked;
pub mod client_message_sent;
pub mod close_chat;
pub mod manager_assigned_to_problem;
pub mod send_client_message;
pub mod send_manager_message;

use crate::error::{AppError, AppResult};
use crate::types::MessageId;

pub(crate) fn marshal_message_id(message_id: MessageId) -> AppResult<String> {
    if message_id.is_nil() {
        return Err(AppError::Payload("nil message id".into()));
    }

    Ok(message_id.to_string())
}

pub(crate) fn unmarshal_message_id(payload: &str) -> AppResult<MessageId> {
    payload
        .parse()
        .map_err(|_| AppError::Payload(format!("not a message id: {payload:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips() {
        let id = MessageId::new();
        let payload = marshal_message_id(id).unwrap();
        assert_eq!(unmarshal_message_id(&payload).unwrap(), id);
    }

    #[test]
    fn nil_message_id_is_rejected() {
        let nil = MessageId::from_uuid(uuid::Uuid::nil());
        assert!(marshal_message_id(nil).is_err());
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(unmarshal_message_id("not-a-uuid").is_err());
    }
}
