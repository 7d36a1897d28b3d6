use super::{AppState, AuthedUser};
use crate::error::AppError;
use crate::models::Message;
use crate::types::{MessageId, RequestId, UserId};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    request_id: RequestId,
    message_body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_id: Option<UserId>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetHistoryRequest {
    #[serde(default)]
    page_size: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_id: Option<UserId>,
    body: String,
    created_at: DateTime<Utc>,
    is_service: bool,
    is_blocked: bool,
    /// Passed the anti-fraud check and reached the manager side.
    is_received: bool,
}

impl From<Message> for ClientMessage {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            author_id: m.author_id,
            body: m.body,
            created_at: m.created_at,
            is_service: m.is_service,
            is_blocked: m.is_blocked,
            is_received: m.is_visible_for_manager,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetHistoryResponse {
    messages: Vec<ClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<String>,
}

async fn send_message(
    user: AuthedUser,
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    let result = state
        .client_chat
        .send_message(user.0, req.request_id, req.message_body)
        .await?;

    Ok(HttpResponse::Ok().json(SendMessageResponse {
        id: result.message_id,
        author_id: result.author_id,
        created_at: result.created_at,
    }))
}

async fn get_history(
    user: AuthedUser,
    state: web::Data<AppState>,
    body: web::Json<GetHistoryRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    let (messages, next) = state
        .client_chat
        .get_history(user.0, req.page_size.unwrap_or(0), req.cursor.as_deref())
        .await?;

    Ok(HttpResponse::Ok().json(GetHistoryResponse {
        messages: messages.into_iter().map(ClientMessage::from).collect(),
        next,
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/client")
            .route("/sendMessage", web::post().to(send_message))
            .route("/getHistory", web::post().to(get_history)),
    );
}
