//! HTTP surface of tidings: accounts, tokens, read-only views over the
//! stores and the `/sub` websocket upgrade.

pub mod auth;
pub mod conversations;
pub mod error;
pub mod health;
pub mod mailer;
pub mod messages;
pub mod middleware;
pub mod subscribe;
pub mod users;
pub mod validate;

use axum::{
    Router, middleware as mw,
    routing::{get, post, put},
};

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;
pub use mailer::{LogMailer, Mail, Mailer};

/// Runs a store call on the blocking pool.
pub(crate) async fn blocking<F, T, E>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?.map_err(Into::into)
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v1/healthcheck", get(health::healthcheck))
        .route("/v1/users", post(auth::register))
        .route("/v1/users/activated", put(auth::activate))
        .route("/v1/tokens/authentication", post(auth::authenticate));

    let protected = Router::new()
        .route("/v1/users/me", get(users::show_me).patch(users::update_me))
        .route("/v1/users/search", get(users::search))
        .route("/v1/conversations", get(conversations::list))
        .route("/v1/messages", get(messages::list))
        .route("/sub", get(subscribe::subscribe))
        .route_layer(mw::from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new().merge(public).merge(protected).with_state(state)
}
