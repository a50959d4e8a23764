use axum::{
    Extension, Json,
    extract::{Query, State},
};
use tracing::{info, warn};

use tidings_db::{SearchField, UserStore};
use tidings_types::api::{SearchQuery, UpdateUserRequest, UserPage, UserResponse};
use tidings_types::{Filter, Operation, ValidationError};

use crate::auth::{AppState, hash_password};
use crate::blocking;
use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::validate;

/// GET /v1/users/me
pub async fn show_me(Extension(current): Extension<CurrentUser>) -> Json<UserResponse> {
    Json(UserResponse::from(&current.0))
}

/// PATCH /v1/users/me
pub async fn update_me(
    State(state): State<AppState>,
    Extension(CurrentUser(mut user)): Extension<CurrentUser>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let mut v = ValidationError::default();
    if let Some(name) = &req.name {
        validate::name(&mut v, name);
    }
    if let Some(email) = &req.email {
        validate::email(&mut v, email);
    }
    if let Some(password) = &req.password {
        validate::password(&mut v, password);
    }
    v.into_result()?;

    let db = state.db.clone();
    let user = blocking(move || -> Result<_, ApiError> {
        if let Some(name) = req.name {
            user.name = name;
        }
        if let Some(email) = req.email {
            user.email = email;
        }
        if let Some(password) = req.password {
            user.password = hash_password(&password)?;
        }
        db.update(&mut user)?;
        Ok(user)
    })
    .await?;

    info!(user_id = %user.id, version = user.version, "profile updated");

    // Correspondents cache our name and email.
    match state.broker.presence().broadcast(user.id, Operation::SyncConvos).await {
        Ok(n) => info!(user_id = %user.id, peers = n, "profile sync sent"),
        Err(e) => warn!(user_id = %user.id, error = %e, "profile sync failed"),
    }

    Ok(Json(UserResponse::from(&user)))
}

/// GET /v1/users/search
pub async fn search(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<UserPage>, ApiError> {
    current.require_activated()?;

    let mut v = ValidationError::default();
    let field = match q.field.as_str() {
        "name" => SearchField::Name,
        "email" => SearchField::Email,
        _ => {
            v.add("field", "must be one of name, email");
            SearchField::Name
        }
    };
    v.check(!q.query.trim().is_empty(), "query", "must be provided");
    let defaults = Filter::default();
    let filter = Filter::new(
        q.page.unwrap_or(defaults.page),
        q.page_size.unwrap_or(defaults.page_size),
    );
    filter.validate(&mut v);
    v.into_result()?;

    let db = state.db.clone();
    let (users, metadata) =
        blocking(move || db.search_by_query(field, q.query.trim(), &filter)).await?;

    Ok(Json(UserPage {
        users: users.iter().map(UserResponse::from).collect(),
        metadata,
    }))
}
