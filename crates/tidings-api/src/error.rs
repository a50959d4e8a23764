use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use tidings_db::StoreError;
use tidings_gateway::GatewayError;
use tidings_types::ValidationError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("the requested resource could not be found")]
    NotFound,

    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,

    #[error("invalid authentication credentials")]
    InvalidCredentials,

    #[error("invalid or missing authentication token")]
    InvalidToken,

    #[error("your user account must be activated to access this resource")]
    InactiveAccount,

    #[error("already subscribed")]
    AlreadySubscribed,

    #[error("{0}")]
    Validation(ValidationError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::EditConflict | ApiError::AlreadySubscribed => StatusCode::CONFLICT,
            ApiError::InvalidCredentials | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::InactiveAccount => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match self {
            ApiError::Validation(v) => (status, Json(v)).into_response(),
            ApiError::InvalidToken => (
                status,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(serde_json::json!({ "error": ApiError::InvalidToken.to_string() })),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal error");
                let body = serde_json::json!({
                    "error": "the server encountered a problem and could not process your request",
                });
                (status, Json(body)).into_response()
            }
            other => {
                let body = serde_json::json!({ "error": other.to_string() });
                (status, Json(body)).into_response()
            }
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(v: ValidationError) -> Self {
        ApiError::Validation(v)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict => ApiError::EditConflict,
            StoreError::DuplicateEmail => ApiError::Validation(ValidationError::single(
                "email",
                "a user with this email address already exists",
            )),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::AlreadySubscribed => ApiError::AlreadySubscribed,
            GatewayError::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
