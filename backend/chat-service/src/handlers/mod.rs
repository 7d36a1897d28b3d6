//! HTTP surface. Authentication itself is an external collaborator: the
//! fronting auth layer introspects the token and injects the caller's id as
//! the `X-User-Id` header, which is all this service trusts.

pub mod client;
pub mod manager;
pub mod websocket;

use crate::error::AppError;
use crate::services::client_chat::ClientChatService;
use crate::services::event_stream::EventStream;
use crate::services::manager_chat::ManagerChatService;
use crate::types::UserId;
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const USER_ID_HEADER: &str = "X-User-Id";

pub struct AppState {
    pub client_chat: ClientChatService,
    pub manager_chat: ManagerChatService,
    pub event_stream: EventStream,
    pub ws_ping_period: Duration,
    pub shutdown: CancellationToken,
}

/// The authenticated caller, recovered from the auth layer's header.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser(pub UserId);

impl FromRequest for AuthedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user_id = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<UserId>().ok());

        ready(user_id.map(AuthedUser).ok_or(AppError::Unauthorized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[actix_web::test]
    async fn extracts_user_id_from_header() {
        let user_id = UserId::new();
        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, user_id.to_string()))
            .to_http_request();

        let extracted = AuthedUser::from_request(&req, &mut Payload::None)
            .await
            .unwrap();
        assert_eq!(extracted.0, user_id);
    }

    #[actix_web::test]
    async fn missing_or_malformed_header_is_unauthorized() {
        let req = TestRequest::default().to_http_request();
        assert!(AuthedUser::from_request(&req, &mut Payload::None)
            .await
            .is_err());

        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, "not-a-uuid"))
            .to_http_request();
        assert!(AuthedUser::from_request(&req, &mut Payload::None)
            .await
            .is_err());
    }
}
