use axum::{
    extract::{Path, State},
    Json,
};

use crate::models::Participant;
use crate::state::RelayContext;

/// Participants currently connected to a session room.
pub async fn get_session_participants(
    State(ctx): State<RelayContext>,
    Path(session_id): Path<String>,
) -> Json<Vec<Participant>> {
    Json(ctx.roster(&session_id).await)
}
