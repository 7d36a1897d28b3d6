//! Per-connection websocket session actor.
//!
//! Three cooperating concerns share the connection lifetime: the heartbeat
//! interval (ping every `ping_period`, drop the peer after two silent
//! periods), the subscription stream forwarding adapted events as text
//! frames, and the process shutdown watcher.

use crate::metrics;
use crate::services::event_stream::{ChatEvent, EventSubscription};
use crate::types::UserId;
use crate::websocket::{serialize_for_role, Role};
use actix::prelude::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct WsSession {
    user_id: UserId,
    role: Role,
    ping_period: Duration,
    hb: Instant,
    subscription: Option<EventSubscription>,
    shutdown: CancellationToken,
}

impl WsSession {
    pub fn new(
        user_id: UserId,
        role: Role,
        ping_period: Duration,
        subscription: EventSubscription,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            user_id,
            role,
            ping_period,
            hb: Instant::now(),
            subscription: Some(subscription),
            shutdown,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let pong_deadline = 2 * self.ping_period;

        ctx.run_interval(self.ping_period, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > pong_deadline {
                tracing::info!(user_id = %act.user_id, "websocket heartbeat missed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, role = ?self.role, "websocket session started");
        metrics::WS_CONNECTIONS.inc();

        self.heartbeat(ctx);

        if let Some(subscription) = self.subscription.take() {
            ctx.add_stream(subscription);
        }

        let shutdown = self.shutdown.clone();
        ctx.spawn(
            async move {
                shutdown.cancelled().await;
            }
            .into_actor(self)
            .map(|_, act, ctx| {
                tracing::info!(user_id = %act.user_id, "closing websocket on shutdown");
                ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Away)));
                ctx.stop();
            }),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        metrics::WS_CONNECTIONS.dec();
        tracing::info!(user_id = %self.user_id, "websocket session stopped");
    }
}

/// Subscription events: adapt per role, serialize, write one text frame.
/// When the stream ends (event stream closed or this subscriber evicted),
/// actix stops the actor, which closes the connection.
impl StreamHandler<ChatEvent> for WsSession {
    fn handle(&mut self, event: ChatEvent, ctx: &mut Self::Context) {
        match serialize_for_role(self.role, &event) {
            Some(Ok(frame)) => ctx.text(frame),
            Some(Err(e)) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "serialize event");
            }
            None => {
                tracing::debug!(user_id = %self.user_id, role = ?self.role, "event not addressed to this role");
            }
        }
    }
}

/// Incoming frames: only pongs (and the occasional ping/close) matter; the
/// read side exists to observe liveness and half-close.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Ping(payload)) => {
                self.hb = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {
                // Inbound data frames are not part of the protocol; events
                // flow server-to-client only.
            }
            Err(e) => {
                tracing::debug!(user_id = %self.user_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}
