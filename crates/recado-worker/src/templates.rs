use std::sync::Arc;

use recado_core::template::{self, TemplateValidation, TemplateVariable};
use recado_db::{NewTemplate, RecadoDb, Template, TemplatePatch};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::scope::ViewerScope;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplate {
    #[serde(default)]
    pub school_id: Option<String>,
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

fn default_category() -> String {
    "general".to_string()
}

/// Template catalogue and rendering.
///
/// Global templates (no school) are managed by admins only. A school manages
/// its own templates and can use both its own and the global ones.
#[derive(Clone)]
pub struct TemplateService {
    db: Arc<RecadoDb>,
}

impl TemplateService {
    pub fn new(db: Arc<RecadoDb>) -> Self {
        Self { db }
    }

    pub async fn list(&self, viewer: &ViewerScope, school_id: Option<&str>) -> Result<Vec<Template>> {
        let school_id = match viewer {
            ViewerScope::School(own) => Some(own.as_str()),
            ViewerScope::Admin => school_id,
        };
        Ok(self.db.list_templates(school_id).await?)
    }

    pub async fn get(&self, viewer: &ViewerScope, id: &str) -> Result<Template> {
        let template = self.db.get_template(id).await?;
        let visible = match (viewer, template.school_id.as_deref()) {
            (ViewerScope::Admin, _) | (_, None) => true,
            (ViewerScope::School(own), Some(owner)) => own == owner,
        };
        if !visible {
            return Err(ServiceError::NotFound(format!("template {id}")));
        }
        Ok(template)
    }

    pub async fn create(&self, viewer: &ViewerScope, request: CreateTemplate) -> Result<Template> {
        let school_id = match (viewer, request.school_id) {
            (ViewerScope::Admin, school_id) => school_id,
            (ViewerScope::School(own), None) => Some(own.clone()),
            (ViewerScope::School(own), Some(requested)) if *own == requested => Some(requested),
            (ViewerScope::School(own), Some(requested)) => {
                return Err(ServiceError::Forbidden(format!(
                    "school {own} cannot create templates for school {requested}"
                )));
            }
        };

        let new = NewTemplate {
            school_id,
            name: non_empty("name", request.name)?,
            category: non_empty("category", request.category)?,
            content: non_empty("content", request.content)?,
            variables: request.variables,
        };
        let template = self.db.create_template(&new).await?;
        info!(template_id = %template.id, school_id = ?template.school_id, "Template created");
        Ok(template)
    }

    pub async fn update(
        &self,
        viewer: &ViewerScope,
        id: &str,
        mut patch: TemplatePatch,
    ) -> Result<Template> {
        let template = self.get(viewer, id).await?;
        if !viewer.can_manage(&template) {
            return Err(ServiceError::Forbidden(format!("template {id} is not editable here")));
        }

        patch.name = patch.name.map(|v| non_empty("name", v)).transpose()?;
        patch.category = patch.category.map(|v| non_empty("category", v)).transpose()?;
        patch.content = patch.content.map(|v| non_empty("content", v)).transpose()?;

        let updated = self.db.update_template(id, &patch).await?;
        info!(template_id = %id, "Template updated");
        Ok(updated)
    }

    /// Soft delete. Messages already rendered from it are untouched.
    pub async fn deactivate(&self, viewer: &ViewerScope, id: &str) -> Result<Template> {
        let template = self.get(viewer, id).await?;
        if !viewer.can_manage(&template) {
            return Err(ServiceError::Forbidden(format!("template {id} is not editable here")));
        }
        Ok(self.db.deactivate_template(id).await?)
    }

    /// Renders an active template visible to `school_id`.
    pub async fn render(
        &self,
        template_id: &str,
        school_id: &str,
        values: &Map<String, Value>,
    ) -> Result<String> {
        let template = self
            .get(&ViewerScope::School(school_id.to_string()), template_id)
            .await?;
        if !template.is_active {
            return Err(ServiceError::NotFound(format!("template {template_id} is inactive")));
        }
        Ok(template::render(&template.content, &template.variables(), values)?)
    }

    pub async fn validate(
        &self,
        viewer: &ViewerScope,
        template_id: &str,
        values: &Map<String, Value>,
    ) -> Result<TemplateValidation> {
        let template = self.get(viewer, template_id).await?;
        Ok(template::validate(&template.content, &template.variables(), values))
    }

    /// Renders ad-hoc content without storing anything.
    pub fn preview(
        &self,
        content: &str,
        variables: &[TemplateVariable],
        values: &Map<String, Value>,
    ) -> Result<String> {
        Ok(template::render(content, variables, values)?)
    }
}

fn non_empty(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(ServiceError::validation(format!("{field} must not be empty")));
    }
    Ok(value)
}
