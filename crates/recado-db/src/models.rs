use recado_core::{Direction, InstanceStatus, MessageStatus, TemplateVariable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub school_id: String,
    pub name: String,
    pub gateway_instance_id: String,
    #[serde(skip_serializing)]
    pub gateway_token: String,
    pub status: InstanceStatus,
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<i64>,
    pub qr_expires_at: Option<i64>,
    pub qr_attempts: i64,
    pub phone_number: Option<String>,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub last_connected_at: Option<i64>,
    pub last_error: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Instance {
    /// The stored QR payload, if the instance is pairing and it has not expired at `now`.
    pub fn fresh_qr(&self, now: i64) -> Option<&str> {
        if self.status != InstanceStatus::Connecting {
            return None;
        }
        match (self.qr_payload.as_deref(), self.qr_expires_at) {
            (Some(qr), Some(expires_at)) if expires_at > now => Some(qr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub school_id: String,
    pub name: String,
    pub gateway_instance_id: String,
    pub gateway_token: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Partial update of an instance's credentials and webhook configuration.
#[derive(Debug, Clone, Default)]
pub struct InstanceConfigUpdate {
    pub name: Option<String>,
    pub gateway_instance_id: Option<String>,
    pub gateway_token: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl InstanceConfigUpdate {
    pub fn touches_credentials(&self) -> bool {
        self.gateway_instance_id.is_some() || self.gateway_token.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    pub instance_id: String,
    pub wa_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub is_group: bool,
    pub lead_id: Option<String>,
    pub student_id: Option<String>,
    pub last_activity_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contact {
    /// Name shown in conversation lists: name, then phone, then the raw id.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.phone.as_deref())
            .unwrap_or(&self.wa_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub instance_id: String,
    pub contact_id: i64,
    pub direction: Direction,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub status: MessageStatus,
    pub external_id: Option<String>,
    pub timestamp: i64,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
    pub metadata: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub instance_id: String,
    pub contact_id: i64,
    pub direction: Direction,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub status: MessageStatus,
    pub external_id: Option<String>,
    pub timestamp: i64,
    pub metadata: Option<serde_json::Value>,
}

/// Result of applying a gateway status event to a stored message.
#[derive(Debug, Clone)]
pub enum StatusUpdateOutcome {
    Applied(Message),
    /// The message exists but the event would not move it forward.
    Ignored(Message),
    /// No message carries this external id.
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub contact: Contact,
    pub last_message: Message,
    pub unread_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LastMessageRow {
    #[sqlx(flatten)]
    pub message: Message,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub school_id: Option<String>,
    pub name: String,
    pub category: String,
    pub content: String,
    #[serde(skip)]
    pub variables_json: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Template {
    pub fn variables(&self) -> Vec<TemplateVariable> {
        serde_json::from_str(&self.variables_json).unwrap_or_else(|e| {
            tracing::warn!(template_id = %self.id, error = %e, "Unreadable template variables");
            Vec::new()
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub school_id: Option<String>,
    pub name: String,
    pub category: String,
    pub content: String,
    pub variables: Vec<TemplateVariable>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub content: Option<String>,
    pub variables: Option<Vec<TemplateVariable>>,
}
