//! In-process per-user pub/sub feeding the websocket sessions.
//!
//! Each subscriber owns a bounded buffer; a subscriber that neither drains
//! its buffer nor disconnects within [`SEND_TIMEOUT`] is evicted so it can
//! never stall the publisher or its neighbours. The durable state plus the
//! message bus remain the authoritative channel; this stream is a
//! best-effort overlay and evicted consumers are expected to reconnect.

use crate::error::{AppError, AppResult};
use crate::types::{ChatId, EventId, MessageId, RequestId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events buffered per subscriber before the slow-consumer policy kicks in.
const SUBSCRIBER_BUFFER: usize = 1024;

/// How long a publish may wait on one subscriber's full buffer.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessageEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// `None` for service messages.
    pub author_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub body: String,
    pub is_service: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSentEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageBlockedEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChatEvent {
    pub event_id: EventId,
    pub chat_id: ChatId,
    pub client_id: UserId,
    pub request_id: RequestId,
    pub can_take_more_problems: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatClosedEvent {
    pub event_id: EventId,
    pub chat_id: ChatId,
    pub request_id: RequestId,
    pub can_take_more_problems: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    NewMessage(NewMessageEvent),
    MessageSent(MessageSentEvent),
    MessageBlocked(MessageBlockedEvent),
    NewChat(NewChatEvent),
    ChatClosed(ChatClosedEvent),
}

impl ChatEvent {
    /// Invalid events must be rejected before any delivery.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ChatEvent::NewMessage(e) => {
                if e.event_id.is_nil()
                    || e.request_id.is_nil()
                    || e.chat_id.is_nil()
                    || e.message_id.is_nil()
                {
                    return Err("new message event: nil identifier".into());
                }
                if e.body.is_empty() {
                    return Err("new message event: empty body".into());
                }
                if !e.is_service && e.author_id.is_none() {
                    return Err("new message event: non-service message without author".into());
                }
                Ok(())
            }
            ChatEvent::MessageSent(e) => {
                if e.event_id.is_nil() || e.request_id.is_nil() || e.message_id.is_nil() {
                    return Err("message sent event: nil identifier".into());
                }
                Ok(())
            }
            ChatEvent::MessageBlocked(e) => {
                if e.event_id.is_nil() || e.request_id.is_nil() || e.message_id.is_nil() {
                    return Err("message blocked event: nil identifier".into());
                }
                Ok(())
            }
            ChatEvent::NewChat(e) => {
                if e.event_id.is_nil()
                    || e.chat_id.is_nil()
                    || e.client_id.is_nil()
                    || e.request_id.is_nil()
                {
                    return Err("new chat event: nil identifier".into());
                }
                Ok(())
            }
            ChatEvent::ChatClosed(e) => {
                if e.event_id.is_nil() || e.chat_id.is_nil() || e.request_id.is_nil() {
                    return Err("chat closed event: nil identifier".into());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriberId(Uuid);

struct SubscriberHandle {
    id: SubscriberId,
    tx: mpsc::Sender<ChatEvent>,
}

#[derive(Default)]
struct Registry {
    subs: HashMap<UserId, Vec<SubscriberHandle>>,
    closed: bool,
}

impl Registry {
    fn remove(&mut self, user_id: UserId, id: SubscriberId) {
        if let Some(handles) = self.subs.get_mut(&user_id) {
            handles.retain(|h| h.id != id);
            if handles.is_empty() {
                self.subs.remove(&user_id);
            }
        }
    }
}

/// Per-user multi-subscriber pub/sub; cheap to clone and share.
#[derive(Clone, Default)]
pub struct EventStream {
    registry: Arc<Mutex<Registry>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for the user. Dropping the returned
    /// subscription deregisters it.
    pub fn subscribe(&self, user_id: UserId) -> AppResult<EventSubscription> {
        let mut registry = self.registry.lock().expect("event stream registry poisoned");
        if registry.closed {
            return Err(AppError::EventStreamClosed);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = SubscriberId(Uuid::new_v4());
        registry
            .subs
            .entry(user_id)
            .or_default()
            .push(SubscriberHandle { id, tx });

        Ok(EventSubscription {
            user_id,
            id,
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Delivers the event to every live subscriber of `user_id`.
    ///
    /// The registry lock is held only to snapshot the send handles; pushes
    /// happen outside it. A subscriber whose buffer stays full for
    /// [`SEND_TIMEOUT`] is evicted.
    pub async fn publish(&self, user_id: UserId, event: ChatEvent) -> AppResult<()> {
        event.validate().map_err(AppError::InvalidEvent)?;

        let handles: Vec<(SubscriberId, mpsc::Sender<ChatEvent>)> = {
            let registry = self.registry.lock().expect("event stream registry poisoned");
            if registry.closed {
                return Err(AppError::EventStreamClosed);
            }
            registry
                .subs
                .get(&user_id)
                .map(|subs| subs.iter().map(|h| (h.id, h.tx.clone())).collect())
                .unwrap_or_default()
        };

        for (id, tx) in handles {
            if tx.is_closed() {
                self.evict(user_id, id);
                continue;
            }

            match tokio::time::timeout(SEND_TIMEOUT, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Receiver gone between the snapshot and the send.
                    self.evict(user_id, id);
                }
                Err(_) => {
                    tracing::warn!(user_id = %user_id, "evicting slow event subscriber");
                    self.evict(user_id, id);
                }
            }
        }

        Ok(())
    }

    /// Marks the stream closed and disconnects every subscriber. Publishes
    /// that already snapshotted their handles finish their bounded sends;
    /// new publishes fail with `EventStreamClosed`.
    pub fn close(&self) {
        let mut registry = self.registry.lock().expect("event stream registry poisoned");
        registry.closed = true;
        registry.subs.clear();
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        let registry = self.registry.lock().expect("event stream registry poisoned");
        registry.subs.get(&user_id).map_or(0, Vec::len)
    }

    fn evict(&self, user_id: UserId, id: SubscriberId) {
        let mut registry = self.registry.lock().expect("event stream registry poisoned");
        registry.remove(user_id, id);
    }
}

/// A live subscription; yields events until the stream closes or the
/// subscriber is evicted.
pub struct EventSubscription {
    user_id: UserId,
    id: SubscriberId,
    rx: mpsc::Receiver<ChatEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl EventSubscription {
    /// `None` once the stream is closed or this subscriber was evicted.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }
}

impl futures::Stream for EventSubscription {
    type Item = ChatEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(self.user_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent_event() -> ChatEvent {
        ChatEvent::MessageSent(MessageSentEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            message_id: MessageId::new(),
        })
    }

    fn message_event(body: &str) -> ChatEvent {
        ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            chat_id: ChatId::new(),
            message_id: MessageId::new(),
            author_id: Some(UserId::new()),
            created_at: Utc::now(),
            body: body.into(),
            is_service: false,
        })
    }

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let stream = EventStream::new();
        let user = UserId::new();
        let mut sub = stream.subscribe(user).unwrap();

        let event = sent_event();
        stream.publish(user, event.clone()).await.unwrap();

        assert_eq!(sub.recv().await, Some(event));
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_of_the_user_only() {
        let stream = EventStream::new();
        let user = UserId::new();
        let other = UserId::new();

        let mut sub_a = stream.subscribe(user).unwrap();
        let mut sub_b = stream.subscribe(user).unwrap();
        let mut stranger = stream.subscribe(other).unwrap();

        let event = sent_event();
        stream.publish(user, event.clone()).await.unwrap();

        assert_eq!(sub_a.recv().await, Some(event.clone()));
        assert_eq!(sub_b.recv().await, Some(event));

        drop(stream);
        assert!(tokio::time::timeout(Duration::from_millis(10), stranger.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn preserves_per_subscriber_order() {
        let stream = EventStream::new();
        let user = UserId::new();
        let mut sub = stream.subscribe(user).unwrap();

        let first = message_event("first");
        let second = message_event("second");
        stream.publish(user, first.clone()).await.unwrap();
        stream.publish(user, second.clone()).await.unwrap();

        assert_eq!(sub.recv().await, Some(first));
        assert_eq!(sub.recv().await, Some(second));
    }

    #[tokio::test]
    async fn rejects_invalid_event_before_delivery() {
        let stream = EventStream::new();
        let user = UserId::new();
        let mut sub = stream.subscribe(user).unwrap();

        let invalid = ChatEvent::NewMessage(NewMessageEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            chat_id: ChatId::new(),
            message_id: MessageId::new(),
            author_id: None,
            created_at: Utc::now(),
            body: "no author, not service".into(),
            is_service: false,
        });

        assert!(matches!(
            stream.publish(user, invalid).await,
            Err(AppError::InvalidEvent(_))
        ));
        assert!(tokio::time::timeout(Duration::from_millis(10), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_stream_refuses_publish_and_subscribe() {
        let stream = EventStream::new();
        let user = UserId::new();
        let mut sub = stream.subscribe(user).unwrap();

        stream.close();

        assert!(matches!(
            stream.publish(user, sent_event()).await,
            Err(AppError::EventStreamClosed)
        ));
        assert!(matches!(
            stream.subscribe(user),
            Err(AppError::EventStreamClosed)
        ));
        // Existing subscription observes end-of-stream.
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_deregisters_it() {
        let stream = EventStream::new();
        let user = UserId::new();

        let sub = stream.subscribe(user).unwrap();
        assert_eq!(stream.subscriber_count(user), 1);

        drop(sub);
        assert_eq!(stream.subscriber_count(user), 0);

        // Publishing into the void is fine.
        stream.publish(user, sent_event()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_slow_subscriber_without_touching_others() {
        let stream = EventStream::new();
        let user = UserId::new();

        let slow = stream.subscribe(user).unwrap();
        let mut healthy = stream.subscribe(user).unwrap();

        // Fill the slow subscriber's buffer to the brim; the healthy one is
        // drained as we go.
        for _ in 0..SUBSCRIBER_BUFFER {
            stream.publish(user, sent_event()).await.unwrap();
            assert!(healthy.recv().await.is_some());
        }

        // One more event overflows the stuck buffer; the publish returns and
        // the stuck subscriber is gone.
        let event = sent_event();
        stream.publish(user, event.clone()).await.unwrap();

        assert_eq!(stream.subscriber_count(user), 1);
        assert_eq!(healthy.recv().await, Some(event));

        drop(slow);
    }
}
