use std::ops::ControlFlow;

use axum::{
    Extension, Json,
    extract::{Query, State},
};

use tidings_db::{MessageStore, StoreError};
use tidings_types::api::MessagePage;
use tidings_types::{Filter, Frame, ValidationError};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;
use crate::middleware::CurrentUser;

/// GET /v1/messages: pending rows the caller sent or has yet to receive,
/// newest first.
pub async fn list(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Query(filter): Query<Filter>,
) -> Result<Json<MessagePage>, ApiError> {
    let user_id = current.require_activated()?.id;

    let mut v = ValidationError::default();
    filter.validate(&mut v);
    v.into_result()?;

    let db = state.db.clone();
    let (messages, metadata) = blocking(move || {
        let mut messages = Vec::new();
        let metadata = db.stream_page(user_id, &filter, &mut |msg| {
            messages.push(Frame::from(msg));
            ControlFlow::Continue(())
        })?;
        Ok::<_, StoreError>((messages, metadata))
    })
    .await?;

    Ok(Json(MessagePage { messages, metadata }))
}
