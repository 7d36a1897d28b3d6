use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Stable error codes surfaced to API consumers. Clients match on the code,
/// never on the message.
pub const CODE_VALIDATION_ERROR: i32 = 4000;
pub const CODE_CREATE_CHAT_ERROR: i32 = 1000;
pub const CODE_CREATE_PROBLEM_ERROR: i32 = 1001;
pub const CODE_NO_ACTIVE_PROBLEM_IN_CHAT: i32 = 4004;
pub const CODE_MANAGER_OVERLOADED: i32 = 5000;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid cursor")]
    InvalidCursor,

    #[error("invalid page size")]
    InvalidPageSize,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("chat not created")]
    ChatNotCreated(#[source] sqlx::Error),

    #[error("problem not created")]
    ProblemNotCreated(#[source] sqlx::Error),

    #[error("no active problem in chat")]
    NoActiveProblemInChat,

    #[error("manager overloaded")]
    ManagerOverloaded,

    #[error("unauthorized")]
    Unauthorized,

    #[error("event stream is closed")]
    EventStreamClosed,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("job {0:?} already registered")]
    JobAlreadyRegistered(String),

    #[error("no available managers")]
    NoAvailableManagers,

    #[error("manager pool capacity exceeded")]
    ManagerCapacityExceeded,

    #[error("unknown status")]
    UnknownVerdictStatus,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::InvalidCursor | AppError::InvalidPageSize => {
                CODE_VALIDATION_ERROR
            }
            AppError::ChatNotCreated(_) => CODE_CREATE_CHAT_ERROR,
            AppError::ProblemNotCreated(_) => CODE_CREATE_PROBLEM_ERROR,
            AppError::NoActiveProblemInChat => CODE_NO_ACTIVE_PROBLEM_IN_CHAT,
            AppError::ManagerOverloaded => CODE_MANAGER_OVERLOADED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND.as_u16() as i32,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED.as_u16() as i32,
            _ => StatusCode::INTERNAL_SERVER_ERROR.as_u16() as i32,
        }
    }

    /// Transient errors are safe to retry; everything else is permanent for
    /// the caller that observed it.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            AppError::Kafka(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: i32,
    message: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InvalidCursor
            | AppError::InvalidPageSize
            | AppError::NoActiveProblemInChat
            | AppError::ManagerOverloaded => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => "something went wrong".to_string(),
            _ => self.to_string(),
        };

        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes() {
        assert_eq!(AppError::NoActiveProblemInChat.code(), 4004);
        assert_eq!(AppError::ManagerOverloaded.code(), 5000);
        assert_eq!(AppError::Validation("bad".into()).code(), 4000);
        assert_eq!(AppError::InvalidCursor.code(), 4000);
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = AppError::Internal("secret pool address".into());
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn not_found_database_error_is_not_retryable() {
        assert!(!AppError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(AppError::Kafka("broker down".into()).is_retryable());
    }
}
