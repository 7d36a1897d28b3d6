//! Socket-facing side of the event stream.
//!
//! The same internal `ChatEvent` variants are translated into two different
//! wire schemas; the adapters here are the single place that enumerates the
//! variants exhaustively. An event that a role never receives is dropped
//! with a log line rather than leaked in the wrong shape.

pub mod session;

use crate::services::event_stream::ChatEvent;
use crate::types::{ChatId, EventId, MessageId, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Manager,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum ClientWireEvent {
    NewMessageEvent {
        event_id: EventId,
        request_id: RequestId,
        message_id: MessageId,
        #[serde(skip_serializing_if = "Option::is_none")]
        author_id: Option<UserId>,
        body: String,
        created_at: DateTime<Utc>,
        is_service: bool,
    },
    MessageSentEvent {
        event_id: EventId,
        request_id: RequestId,
        message_id: MessageId,
    },
    MessageBlockedEvent {
        event_id: EventId,
        request_id: RequestId,
        message_id: MessageId,
    },
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum ManagerWireEvent {
    NewMessageEvent {
        event_id: EventId,
        chat_id: ChatId,
        request_id: RequestId,
        message_id: MessageId,
        #[serde(skip_serializing_if = "Option::is_none")]
        author_id: Option<UserId>,
        body: String,
        created_at: DateTime<Utc>,
        is_service: bool,
    },
    NewChatEvent {
        event_id: EventId,
        chat_id: ChatId,
        client_id: UserId,
        request_id: RequestId,
        can_take_more_problems: bool,
    },
    ChatClosedEvent {
        event_id: EventId,
        chat_id: ChatId,
        request_id: RequestId,
        can_take_more_problems: bool,
    },
}

pub fn adapt_for_client(event: &ChatEvent) -> Option<ClientWireEvent> {
    match event {
        ChatEvent::NewMessage(e) => Some(ClientWireEvent::NewMessageEvent {
            event_id: e.event_id,
            request_id: e.request_id,
            message_id: e.message_id,
            author_id: e.author_id,
            body: e.body.clone(),
            created_at: e.created_at,
            is_service: e.is_service,
        }),
        ChatEvent::MessageSent(e) => Some(ClientWireEvent::MessageSentEvent {
            event_id: e.event_id,
            request_id: e.request_id,
            message_id: e.message_id,
        }),
        ChatEvent::MessageBlocked(e) => Some(ClientWireEvent::MessageBlockedEvent {
            event_id: e.event_id,
            request_id: e.request_id,
            message_id: e.message_id,
        }),
        ChatEvent::NewChat(_) | ChatEvent::ChatClosed(_) => None,
    }
}

pub fn adapt_for_manager(event: &ChatEvent) -> Option<ManagerWireEvent> {
    match event {
        ChatEvent::NewMessage(e) => Some(ManagerWireEvent::NewMessageEvent {
            event_id: e.event_id,
            chat_id: e.chat_id,
            request_id: e.request_id,
            message_id: e.message_id,
            author_id: e.author_id,
            body: e.body.clone(),
            created_at: e.created_at,
            is_service: e.is_service,
        }),
        ChatEvent::NewChat(e) => Some(ManagerWireEvent::NewChatEvent {
            event_id: e.event_id,
            chat_id: e.chat_id,
            client_id: e.client_id,
            request_id: e.request_id,
            can_take_more_problems: e.can_take_more_problems,
        }),
        ChatEvent::ChatClosed(e) => Some(ManagerWireEvent::ChatClosedEvent {
            event_id: e.event_id,
            chat_id: e.chat_id,
            request_id: e.request_id,
            can_take_more_problems: e.can_take_more_problems,
        }),
        ChatEvent::MessageSent(_) | ChatEvent::MessageBlocked(_) => None,
    }
}

/// Serializes an event for the given role; `None` when the role never
/// receives this variant.
pub fn serialize_for_role(role: Role, event: &ChatEvent) -> Option<serde_json::Result<String>> {
    match role {
        Role::Client => adapt_for_client(event).map(|e| serde_json::to_string(&e)),
        Role::Manager => adapt_for_manager(event).map(|e| serde_json::to_string(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_stream::{
        ChatClosedEvent, MessageBlockedEvent, MessageSentEvent, NewChatEvent, NewMessageEvent,
    };

    fn new_message_event() -> ChatEvent {
        ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            chat_id: ChatId::new(),
            message_id: MessageId::new(),
            author_id: Some(UserId::new()),
            created_at: Utc::now(),
            body: "hello".into(),
            is_service: false,
        })
    }

    fn new_chat_event() -> ChatEvent {
        ChatEvent::NewChat(NewChatEvent {
            event_id: EventId::new(),
            chat_id: ChatId::new(),
            client_id: UserId::new(),
            request_id: RequestId::new(),
            can_take_more_problems: false,
        })
    }

    #[test]
    fn client_new_message_wire_shape() {
        let event = new_message_event();
        let json = serialize_for_role(Role::Client, &event).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["eventType"], "NewMessageEvent");
        assert!(value.get("eventId").is_some());
        assert!(value.get("requestId").is_some());
        assert!(value.get("messageId").is_some());
        assert!(value.get("authorId").is_some());
        assert_eq!(value["body"], "hello");
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["isService"], false);
        // The client schema carries no chat id.
        assert!(value.get("chatId").is_none());
    }

    #[test]
    fn manager_new_message_wire_shape_has_chat_id() {
        let event = new_message_event();
        let json = serialize_for_role(Role::Manager, &event).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["eventType"], "NewMessageEvent");
        assert!(value.get("chatId").is_some());
    }

    #[test]
    fn service_message_omits_author() {
        let event = ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            chat_id: ChatId::new(),
            message_id: MessageId::new(),
            author_id: None,
            created_at: Utc::now(),
            body: "manager will answer you".into(),
            is_service: true,
        });

        let json = serialize_for_role(Role::Client, &event).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("authorId").is_none());
        assert_eq!(value["isService"], true);
    }

    #[test]
    fn manager_new_chat_wire_shape() {
        let event = new_chat_event();
        let json = serialize_for_role(Role::Manager, &event).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["eventType"], "NewChatEvent");
        assert!(value.get("chatId").is_some());
        assert!(value.get("clientId").is_some());
        assert_eq!(value["canTakeMoreProblems"], false);
    }

    #[test]
    fn chat_closed_goes_to_manager_only() {
        let event = ChatEvent::ChatClosed(ChatClosedEvent {
            event_id: EventId::new(),
            chat_id: ChatId::new(),
            request_id: RequestId::new(),
            can_take_more_problems: true,
        });

        assert!(adapt_for_client(&event).is_none());
        let wire = adapt_for_manager(&event).unwrap();
        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(value["eventType"], "ChatClosedEvent");
        assert_eq!(value["canTakeMoreProblems"], true);
    }

    #[test]
    fn lifecycle_signals_go_to_client_only() {
        let sent = ChatEvent::MessageSent(MessageSentEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            message_id: MessageId::new(),
        });
        let blocked = ChatEvent::MessageBlocked(MessageBlockedEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            message_id: MessageId::new(),
        });

        assert!(adapt_for_manager(&sent).is_none());
        assert!(adapt_for_manager(&blocked).is_none());

        let value = serde_json::to_value(adapt_for_client(&sent).unwrap()).unwrap();
        assert_eq!(value["eventType"], "MessageSentEvent");
        let value = serde_json::to_value(adapt_for_client(&blocked).unwrap()).unwrap();
        assert_eq!(value["eventType"], "MessageBlockedEvent");
    }

    #[test]
    fn new_chat_never_reaches_a_client() {
        assert!(adapt_for_client(&new_chat_event()).is_none());
    }
}
