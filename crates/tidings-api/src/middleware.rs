use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use tidings_db::{TokenScope, User, UserStore, tokens};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

/// The user behind the request's bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl CurrentUser {
    pub fn require_activated(&self) -> Result<&User, ApiError> {
        if self.0.activated {
            Ok(&self.0)
        } else {
            Err(ApiError::InactiveAccount)
        }
    }
}

/// Resolve `Authorization: Bearer <token>` to a user.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ApiError::InvalidToken)?;

    let hash = tokens::hash_plaintext(bearer.token());
    let db = state.db.clone();
    let user = blocking(move || db.get_for_token(TokenScope::Authentication, &hash))
        .await
        .map_err(|e| match e {
            ApiError::NotFound => ApiError::InvalidToken,
            e => e,
        })?;

    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}
