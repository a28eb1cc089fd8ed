use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use recado_worker::{Message, SendRequest};

use super::{Actor, AppState};
use crate::error::ApiResult;

/// `POST /messages` with either `content` or `templateId` plus `variables`.
pub async fn send(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Json(request): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state.worker.dispatcher().send(&viewer, request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
