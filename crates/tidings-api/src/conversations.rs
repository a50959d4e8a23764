use axum::{Extension, Json, extract::State};

use tidings_db::ConversationStore;
use tidings_types::api::CorrespondentResponse;

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;
use crate::middleware::CurrentUser;

/// GET /v1/conversations
pub async fn list(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<CorrespondentResponse>>, ApiError> {
    let user_id = current.require_activated()?.id;

    let db = state.db.clone();
    let peers = blocking(move || db.list_for(user_id)).await?;

    let registry = state.broker.registry();
    Ok(Json(
        peers
            .into_iter()
            .map(|p| CorrespondentResponse {
                online: registry.is_online(p.peer_id),
                peer_id: p.peer_id,
                peer_name: p.peer_name,
                peer_email: p.peer_email,
                peer_last_online: p.peer_last_online,
            })
            .collect(),
    ))
}
