use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use recado_core::template::{self, TemplateValidation, TemplateVariable};
use recado_db::TemplatePatch;
use recado_worker::{CreateTemplate, Template, ViewerScope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Actor, AppState};
use crate::error::{ApiError, ApiResult};

#[derive(Serialize)]
pub struct TemplateView {
    #[serde(flatten)]
    template: Template,
    variables: Vec<TemplateVariable>,
}

impl From<Template> for TemplateView {
    fn from(template: Template) -> Self {
        let variables = template.variables();
        Self {
            template,
            variables,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    school_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateTemplate {
    name: Option<String>,
    category: Option<String>,
    content: Option<String>,
    variables: Option<Vec<TemplateVariable>>,
}

#[derive(Deserialize)]
pub struct ContentBody {
    content: String,
}

/// Either a stored template or ad-hoc content, plus the values to apply.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBody {
    template_id: Option<String>,
    content: Option<String>,
    #[serde(default)]
    variables: Vec<TemplateVariable>,
    #[serde(default)]
    values: Map<String, Value>,
}

impl ProcessBody {
    async fn resolve(
        self,
        state: &AppState,
        viewer: &ViewerScope,
    ) -> ApiResult<(String, Vec<TemplateVariable>, Map<String, Value>)> {
        match (self.template_id, self.content) {
            (Some(id), _) => {
                let stored = state.worker.templates().get(viewer, &id).await?;
                let variables = stored.variables();
                Ok((stored.content, variables, self.values))
            }
            (None, Some(content)) => Ok((content, self.variables, self.values)),
            (None, None) => Err(ApiError::BadRequest(
                "either templateId or content is required".to_string(),
            )),
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<TemplateView>>> {
    let templates = state
        .worker
        .templates()
        .list(&viewer, query.school_id.as_deref())
        .await?;
    Ok(Json(templates.into_iter().map(TemplateView::from).collect()))
}

pub async fn get(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<TemplateView>> {
    let template = state.worker.templates().get(&viewer, &id).await?;
    Ok(Json(template.into()))
}

pub async fn create(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Json(body): Json<CreateTemplate>,
) -> ApiResult<(StatusCode, Json<TemplateView>)> {
    let template = state.worker.templates().create(&viewer, body).await?;
    Ok((StatusCode::CREATED, Json(template.into())))
}

pub async fn update(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
    Json(body): Json<UpdateTemplate>,
) -> ApiResult<Json<TemplateView>> {
    let patch = TemplatePatch {
        name: body.name,
        category: body.category,
        content: body.content,
        variables: body.variables,
    };
    let template = state.worker.templates().update(&viewer, &id, patch).await?;
    Ok(Json(template.into()))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Path(id): Path<String>,
) -> ApiResult<Json<TemplateView>> {
    let template = state.worker.templates().deactivate(&viewer, &id).await?;
    Ok(Json(template.into()))
}

pub async fn extract_variables(Json(body): Json<ContentBody>) -> Json<Value> {
    Json(json!({ "variables": template::extract_variables(&body.content) }))
}

pub async fn process(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Json(body): Json<ProcessBody>,
) -> ApiResult<Json<Value>> {
    let (content, variables, values) = body.resolve(&state, &viewer).await?;
    let rendered = state
        .worker
        .templates()
        .preview(&content, &variables, &values)?;
    Ok(Json(json!({ "content": rendered })))
}

pub async fn validate(
    State(state): State<AppState>,
    Actor(viewer): Actor,
    Json(body): Json<ProcessBody>,
) -> ApiResult<Json<TemplateValidation>> {
    let (content, variables, values) = body.resolve(&state, &viewer).await?;
    Ok(Json(template::validate(&content, &variables, &values)))
}
