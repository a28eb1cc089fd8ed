use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use recado_db::{Instance, InstanceConfigUpdate};
use recado_worker::{CreateInstance, InstanceSummary};
use serde::{Deserialize, Serialize};

use super::{Actor, AppState};
use crate::error::ApiResult;
use crate::qr::render_qr_svg;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    #[serde(flatten)]
    summary: InstanceSummary,
    qr_svg: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectView {
    instance: InstanceView,
    gateway_error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstance {
    name: Option<String>,
    gateway_instance_id: Option<String>,
    gateway_token: Option<String>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
}

impl From<UpdateInstance> for InstanceConfigUpdate {
    fn from(body: UpdateInstance) -> Self {
        Self {
            name: body.name,
            gateway_instance_id: body.gateway_instance_id,
            gateway_token: body.gateway_token,
            webhook_url: body.webhook_url,
            webhook_secret: body.webhook_secret,
        }
    }
}

fn view(state: &AppState, instance: &Instance) -> InstanceView {
    let summary = state.worker.registry().summary(instance);
    let qr_svg = summary.qr_code.as_deref().and_then(render_qr_svg);
    InstanceView { summary, qr_svg }
}

pub async fn create(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Json(body): Json<CreateInstance>,
) -> ApiResult<(StatusCode, Json<InstanceView>)> {
    let instance = state.worker.registry().create(&viewer, body).await?;
    Ok((StatusCode::CREATED, Json(view(&state, &instance))))
}

/// `GET /instance/{schoolId}`
pub async fn get_for_school(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(school_id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let instance = state.worker.registry().for_school(&viewer, &school_id).await?;
    Ok(Json(view(&state, &instance)))
}

pub async fn update(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
    Json(body): Json<UpdateInstance>,
) -> ApiResult<Json<InstanceView>> {
    let instance = state
        .worker
        .connections()
        .update_config(&viewer, &id, &body.into())
        .await?;
    Ok(Json(view(&state, &instance)))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let instance = state.worker.connections().deactivate(&viewer, &id).await?;
    Ok(Json(view(&state, &instance)))
}

pub async fn connect(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let instance = state.worker.connections().request_connect(&viewer, &id).await?;
    Ok(Json(view(&state, &instance)))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<DisconnectView>> {
    let outcome = state.worker.connections().request_disconnect(&viewer, &id).await?;
    Ok(Json(DisconnectView {
        instance: view(&state, &outcome.instance),
        gateway_error: outcome.gateway_error,
    }))
}

/// One status poll, for clients that drive polling themselves.
pub async fn poll_status(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let instance = state.worker.connections().poll_status(&viewer, &id).await?;
    Ok(Json(view(&state, &instance)))
}
