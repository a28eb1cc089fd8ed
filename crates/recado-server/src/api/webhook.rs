use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use recado_gateway::SIGNATURE_HEADER;
use recado_worker::IngestOutcome;
use serde_json::{Value, json};

use super::AppState;
use crate::error::ApiResult;

/// `POST /webhook/{instanceId}`. Duplicates and stale events still answer 200
/// so the gateway stops redelivering them.
pub async fn receive(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state
        .worker
        .handle_webhook(&instance_id, &body, signature)
        .await?;

    let (result, message_id) = match &outcome {
        IngestOutcome::Stored(m) => ("stored", Some(m.id)),
        IngestOutcome::Duplicate(m) => ("duplicate", Some(m.id)),
        IngestOutcome::StatusApplied(m) => ("status_applied", Some(m.id)),
        IngestOutcome::StatusIgnored(m) => ("status_ignored", Some(m.id)),
        IngestOutcome::UnknownMessage => ("unknown_message", None),
        IngestOutcome::Connection(_) => ("connection_applied", None),
    };
    Ok(Json(json!({ "result": result, "messageId": message_id })))
}
