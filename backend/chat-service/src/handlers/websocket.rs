use super::{AppState, AuthedUser};
use crate::websocket::session::WsSession;
use crate::websocket::Role;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

async fn client_events(
    req: HttpRequest,
    stream: web::Payload,
    user: AuthedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    start_session(Role::Client, req, stream, user, state)
}

async fn manager_events(
    req: HttpRequest,
    stream: web::Payload,
    user: AuthedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    start_session(Role::Manager, req, stream, user, state)
}

fn start_session(
    role: Role,
    req: HttpRequest,
    stream: web::Payload,
    user: AuthedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let subscription = state.event_stream.subscribe(user.0)?;

    let session = WsSession::new(
        user.0,
        role,
        state.ws_ping_period,
        subscription,
        state.shutdown.clone(),
    );

    ws::start(session, &req, stream)
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/client", web::get().to(client_events))
        .route("/ws/manager", web::get().to(manager_events));
}
