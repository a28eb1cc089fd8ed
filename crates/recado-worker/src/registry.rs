use std::sync::Arc;

use chrono::Utc;
use recado_core::InstanceStatus;
use recado_db::{Instance, NewInstance, RecadoDb};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::scope::ViewerScope;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstance {
    pub school_id: String,
    pub name: String,
    pub gateway_instance_id: String,
    pub gateway_token: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// What a school sees of its instance. The QR is only present while it can
/// still be scanned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub school_id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub qr_expires_at: Option<i64>,
    pub qr_attempts: i64,
    pub webhook_url: Option<String>,
    pub has_webhook_secret: bool,
    pub last_connected_at: Option<i64>,
    pub last_error: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// CRUD over instances. Status is left to the connection manager.
#[derive(Clone)]
pub struct InstanceRegistry {
    db: Arc<RecadoDb>,
    config: Arc<ServiceConfig>,
}

impl InstanceRegistry {
    pub fn new(db: Arc<RecadoDb>, config: Arc<ServiceConfig>) -> Self {
        Self { db, config }
    }

    /// Schools may only register their own instance.
    pub async fn create(&self, viewer: &ViewerScope, request: CreateInstance) -> Result<Instance> {
        if let ViewerScope::School(own) = viewer {
            if own.as_str() != request.school_id.trim() {
                return Err(ServiceError::Forbidden(format!(
                    "school {own} cannot register an instance for school {}",
                    request.school_id
                )));
            }
        }
        let new = NewInstance {
            school_id: required("schoolId", &request.school_id)?,
            name: required("name", &request.name)?,
            gateway_instance_id: required("gatewayInstanceId", &request.gateway_instance_id)?,
            gateway_token: required("gatewayToken", &request.gateway_token)?,
            webhook_url: non_blank(request.webhook_url),
            webhook_secret: non_blank(request.webhook_secret),
        };

        let instance = self.db.create_instance(&new).await?;
        info!(instance_id = %instance.id, school_id = %instance.school_id, "Instance registered");
        Ok(instance)
    }

    pub async fn get(&self, instance_id: &str) -> Result<Instance> {
        Ok(self.db.get_instance(instance_id).await?)
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Instance>> {
        Ok(self.db.list_instances(active_only).await?)
    }

    /// The active instance of a school. Other schools see nothing.
    pub async fn for_school(&self, viewer: &ViewerScope, school_id: &str) -> Result<Instance> {
        if viewer.school_id().is_some_and(|own| own != school_id) {
            return Err(ServiceError::NotFound(format!("school {school_id} has no instance")));
        }
        self.db
            .active_instance_for_school(school_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("school {school_id} has no instance")))
    }

    pub fn summary(&self, instance: &Instance) -> InstanceSummary {
        let now = Utc::now().timestamp();
        let qr_code = instance.fresh_qr(now).map(str::to_string);
        InstanceSummary {
            id: instance.id.clone(),
            school_id: instance.school_id.clone(),
            name: instance.name.clone(),
            status: instance.status,
            phone_number: instance.phone_number.clone(),
            qr_expires_at: qr_code.as_ref().and(instance.qr_expires_at),
            qr_code,
            qr_attempts: instance.qr_attempts,
            webhook_url: self.webhook_url(instance),
            has_webhook_secret: self.webhook_secret(instance).is_some(),
            last_connected_at: instance.last_connected_at,
            last_error: instance.last_error.clone(),
            is_active: instance.is_active,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }

    /// The configured webhook URL, or one derived from the public URL.
    pub fn webhook_url(&self, instance: &Instance) -> Option<String> {
        instance.webhook_url.clone().or_else(|| {
            self.config
                .public_url
                .as_deref()
                .map(|base| format!("{}/webhook/{}", base.trim_end_matches('/'), instance.id))
        })
    }

    /// The instance's own secret wins over the service-wide one.
    pub fn webhook_secret<'a>(&'a self, instance: &'a Instance) -> Option<&'a str> {
        instance
            .webhook_secret
            .as_deref()
            .or(self.config.webhook_secret.as_deref())
            .filter(|secret| !secret.is_empty())
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
