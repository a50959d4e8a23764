use axum::{
    Extension,
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::{debug, warn};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::CurrentUser;

/// GET /sub
///
/// The session slot is claimed before the upgrade so a second subscription
/// gets a plain 409 instead of a socket that closes straight away.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = current.require_activated()?.id;
    let admission = state.broker.admit(user_id)?;
    debug!(user_id = %user_id, conn_id = %admission.handle.conn_id(), "subscription admitted");

    let handle = admission.handle.clone();
    let on_fail = state.broker.clone();
    let broker = state.broker.clone();

    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(user_id = %user_id, error = %e, "websocket upgrade failed");
            on_fail.release(&handle);
        })
        .on_upgrade(move |socket| async move {
            broker.spawn_session(admission, socket);
        }))
}
