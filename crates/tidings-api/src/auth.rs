use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode};
use chrono::Duration;
use tracing::{error, info};

use tidings_db::{Database, StoreError, Token, TokenScope, UserField, UserStore, tokens, users};
use tidings_gateway::Broker;
use tidings_types::ValidationError;
use tidings_types::api::{
    ActivateRequest, AuthenticateRequest, RegisterRequest, TokenResponse, UserResponse,
};

use crate::blocking;
use crate::error::ApiError;
use crate::mailer::{Mail, Mailer};
use crate::validate;

const ACTIVATION_TTL_DAYS: i64 = 3;
const AUTHENTICATION_TTL_HOURS: i64 = 24;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub broker: Broker,
    pub mailer: Arc<dyn Mailer>,
}

pub(crate) fn hash_password(password: &str) -> Result<Vec<u8>, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hash: {e}")))?;
    Ok(hash.to_string().into_bytes())
}

fn password_matches(password: &str, stored: &[u8]) -> Result<bool, ApiError> {
    let stored = std::str::from_utf8(stored)
        .map_err(|e| ApiError::Internal(format!("stored password hash: {e}")))?;
    let parsed = PasswordHash::new(stored)
        .map_err(|e| ApiError::Internal(format!("stored password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// POST /v1/users
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let mut v = ValidationError::default();
    validate::name(&mut v, &req.name);
    validate::email(&mut v, &req.email);
    validate::password(&mut v, &req.password);
    v.into_result()?;

    let db = state.db.clone();
    let (user, token) = blocking(move || -> Result<_, ApiError> {
        let password = hash_password(&req.password)?;
        let out = db.run_in_transaction(|tx| {
            let id = users::insert(tx, &req.name, &req.email, &password)?;
            let token = Token::generate(
                id,
                Duration::days(ACTIVATION_TTL_DAYS),
                TokenScope::Activation,
            );
            tokens::insert(tx, &token)?;
            Ok((users::get_by(tx, UserField::Id(id))?, token))
        })?;
        Ok(out)
    })
    .await?;

    info!(user_id = %user.id, "user registered");

    let mailer = state.mailer.clone();
    let mail = Mail::activation(&user, &token);
    let user_id = user.id;
    state.broker.supervisor().spawn("activation-mail", async move {
        match tokio::task::spawn_blocking(move || mailer.send(&mail)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(user_id = %user_id, error = %e, "activation mail failed"),
            Err(e) => error!(user_id = %user_id, error = %e, "activation mail task failed"),
        }
    });

    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

/// PUT /v1/users/activated
pub async fn activate(
    State(state): State<AppState>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let mut v = ValidationError::default();
    validate::token(&mut v, &req.token);
    v.into_result()?;

    let db = state.db.clone();
    let hash = tokens::hash_plaintext(&req.token);
    let user = blocking(move || {
        db.run_in_transaction(|tx| {
            let mut user = users::get_for_token(tx, TokenScope::Activation, &hash)?;
            users::activate(tx, &mut user)?;
            tokens::delete_all_for_user(tx, TokenScope::Activation, user.id)?;
            Ok(user)
        })
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::Validation(ValidationError::single(
                "token",
                "invalid or expired activation token",
            )),
            e => e.into(),
        })
    })
    .await?;

    info!(user_id = %user.id, "user activated");
    Ok(Json(UserResponse::from(&user)))
}

/// POST /v1/tokens/authentication
pub async fn authenticate(
    State(state): State<AppState>,
    Json(req): Json<AuthenticateRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let mut v = ValidationError::default();
    validate::email(&mut v, &req.email);
    v.check(!req.password.is_empty(), "password", "must be provided");
    v.into_result()?;

    let db = state.db.clone();
    let token = blocking(move || -> Result<Token, ApiError> {
        let user = match db.get_by(UserField::Email(&req.email)) {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(ApiError::InvalidCredentials),
            Err(e) => return Err(e.into()),
        };
        if !password_matches(&req.password, &user.password)? {
            return Err(ApiError::InvalidCredentials);
        }

        let token = Token::generate(
            user.id,
            Duration::hours(AUTHENTICATION_TTL_HOURS),
            TokenScope::Authentication,
        );
        db.with_conn(|conn| tokens::insert(conn, &token))?;
        Ok(token)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            token: token.plaintext,
            expiry: token.expiry,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with(b"$argon2"));
        assert!(password_matches("correct horse", &hash).unwrap());
        assert!(!password_matches("battery staple", &hash).unwrap());
    }

    #[test]
    fn garbage_hash_is_an_internal_error() {
        let err = password_matches("pw", b"not a phc string").unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
