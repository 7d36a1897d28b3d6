use super::{AppState, AuthedUser};
use crate::error::AppError;
use crate::models::{Chat, Message};
use crate::types::{ChatId, MessageId, RequestId, UserId};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FreeHandsBtnAvailability {
    available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatItem {
    chat_id: ChatId,
    client_id: UserId,
}

impl From<Chat> for ChatItem {
    fn from(c: Chat) -> Self {
        Self {
            chat_id: c.id,
            client_id: c.client_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetChatHistoryRequest {
    chat_id: ChatId,
    #[serde(default)]
    page_size: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManagerMessage {
    id: MessageId,
    chat_id: ChatId,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_id: Option<UserId>,
    body: String,
    created_at: DateTime<Utc>,
}

impl From<Message> for ManagerMessage {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            chat_id: m.chat_id,
            author_id: m.author_id,
            body: m.body,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    chat_id: ChatId,
    request_id: RequestId,
    message_body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseChatRequest {
    chat_id: ChatId,
    request_id: RequestId,
}

async fn free_hands(user: AuthedUser, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.manager_chat.free_hands(user.0).await?;
    Ok(HttpResponse::Ok().json(json!({})))
}

async fn get_free_hands_btn_availability(
    user: AuthedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let available = state.manager_chat.can_receive_problems(user.0).await?;
    Ok(HttpResponse::Ok().json(FreeHandsBtnAvailability { available }))
}

async fn get_chats(user: AuthedUser, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let chats = state.manager_chat.get_chats(user.0).await?;
    Ok(HttpResponse::Ok().json(json!({
        "chats": chats.into_iter().map(ChatItem::from).collect::<Vec<_>>(),
    })))
}

async fn get_chat_history(
    user: AuthedUser,
    state: web::Data<AppState>,
    body: web::Json<GetChatHistoryRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    let (messages, next) = state
        .manager_chat
        .get_chat_history(
            user.0,
            req.chat_id,
            req.page_size.unwrap_or(0),
            req.cursor.as_deref(),
        )
        .await?;

    let messages: Vec<ManagerMessage> = messages.into_iter().map(ManagerMessage::from).collect();
    let mut response = json!({ "messages": messages });
    if let Some(next) = next {
        response["next"] = json!(next);
    }

    Ok(HttpResponse::Ok().json(response))
}

async fn send_message(
    user: AuthedUser,
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    let msg = state
        .manager_chat
        .send_message(user.0, req.chat_id, req.request_id, req.message_body)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "id": msg.id,
        "authorId": msg.author_id,
        "createdAt": msg.created_at,
    })))
}

async fn close_chat(
    user: AuthedUser,
    state: web::Data<AppState>,
    body: web::Json<CloseChatRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    state
        .manager_chat
        .close_chat(user.0, req.chat_id, req.request_id)
        .await?;

    Ok(HttpResponse::Ok().json(json!({})))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/manager")
            .route("/freeHands", web::post().to(free_hands))
            .route(
                "/getFreeHandsBtnAvailability",
                web::post().to(get_free_hands_btn_availability),
            )
            .route("/getChats", web::post().to(get_chats))
            .route("/getChatHistory", web::post().to(get_chat_history))
            .route("/sendMessage", web::post().to(send_message))
            .route("/closeChat", web::post().to(close_chat)),
    );
}
