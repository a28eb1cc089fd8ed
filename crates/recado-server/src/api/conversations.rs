use axum::Json;
use axum::extract::{Path, Query, State};
use recado_worker::{Contact, Conversation, Message, ViewerScope};
use serde::{Deserialize, Serialize};

use super::{Actor, AppState};
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceQuery {
    instance_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    up_to_message_id: Option<i64>,
}

#[derive(Serialize)]
pub struct MarkReadView {
    marked: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkContactBody {
    lead_id: Option<String>,
    student_id: Option<String>,
}

/// `GET /conversations/{viewerId}`; `viewerId` is a school id or `admin`.
pub async fn list(
    State(state): State<AppState>,
    Path(viewer_id): Path<String>,
    Query(query): Query<InstanceQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let viewer = ViewerScope::parse(&viewer_id);
    let conversations = state
        .worker
        .conversations()
        .list_conversations(&viewer, query.instance_id.as_deref())
        .await?;
    Ok(Json(conversations))
}

pub async fn thread(
    State(state): State<AppState>,
    Path((viewer_id, contact_id)): Path<(String, i64)>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let viewer = ViewerScope::parse(&viewer_id);
    let messages = state
        .worker
        .conversations()
        .open_thread(&viewer, contact_id, page.limit, page.offset)
        .await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path((viewer_id, contact_id)): Path<(String, i64)>,
    body: Option<Json<MarkReadBody>>,
) -> ApiResult<Json<MarkReadView>> {
    let viewer = ViewerScope::parse(&viewer_id);
    let up_to = body.and_then(|Json(body)| body.up_to_message_id);
    let marked = state
        .worker
        .conversations()
        .mark_read(&viewer, contact_id, up_to)
        .await?;
    Ok(Json(MarkReadView { marked }))
}

/// `GET /contacts/{instanceId}`
pub async fn contacts(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Vec<Contact>>> {
    let contacts = state
        .worker
        .conversations()
        .contacts(&viewer, Some(&instance_id))
        .await?;
    Ok(Json(contacts))
}

/// `PATCH /contacts/{contactId}`
pub async fn link_contact(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(contact_id): Path<String>,
    Json(body): Json<LinkContactBody>,
) -> ApiResult<Json<Contact>> {
    let contact_id: i64 = contact_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid contact id '{contact_id}'")))?;
    let contact = state
        .worker
        .conversations()
        .link_contact(
            &viewer,
            contact_id,
            body.lead_id.as_deref(),
            body.student_id.as_deref(),
        )
        .await?;
    Ok(Json(contact))
}
