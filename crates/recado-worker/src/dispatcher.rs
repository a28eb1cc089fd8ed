use std::sync::Arc;

use chrono::Utc;
use recado_core::{Direction, InstanceStatus, MessageStatus};
use recado_db::{DbError, Message, NewMessage, RecadoDb};
use recado_gateway::GatewayClient;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::cache::ConversationCache;
use crate::config::ServiceConfig;
use crate::connection::{bounded, credentials};
use crate::error::{Result, ServiceError};
use crate::events::WorkerEvent;
use crate::scope::ViewerScope;
use crate::templates::TemplateService;

/// Either literal text or a template rendered with `variables`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutboundBody {
    #[serde(rename_all = "camelCase")]
    Template {
        template_id: String,
        #[serde(default)]
        variables: Map<String, Value>,
    },
    Text { content: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub instance_id: String,
    pub contact_id: i64,
    #[serde(flatten)]
    pub body: OutboundBody,
}

/// Sends messages through a connected instance.
///
/// Every attempt leaves a row behind: `pending` while the gateway call is in
/// flight, then `sent` or `failed`.
#[derive(Clone)]
pub struct OutboundDispatcher {
    db: Arc<RecadoDb>,
    gateway: Arc<dyn GatewayClient>,
    templates: TemplateService,
    cache: Arc<ConversationCache>,
    config: Arc<ServiceConfig>,
    events: broadcast::Sender<WorkerEvent>,
}

impl OutboundDispatcher {
    pub(crate) fn new(
        db: Arc<RecadoDb>,
        gateway: Arc<dyn GatewayClient>,
        templates: TemplateService,
        cache: Arc<ConversationCache>,
        config: Arc<ServiceConfig>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            db,
            gateway,
            templates,
            cache,
            config,
            events,
        }
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, contact_id = request.contact_id))]
    pub async fn send(&self, viewer: &ViewerScope, request: SendRequest) -> Result<Message> {
        let instance = self.db.get_instance(&request.instance_id).await?;
        if !viewer.can_view(&instance) {
            return Err(ServiceError::NotFound(format!("instance {}", request.instance_id)));
        }
        if !instance.is_active || instance.status != InstanceStatus::Connected {
            return Err(ServiceError::NotConnected(instance.id));
        }

        let contact = self.db.get_contact(request.contact_id).await?;
        if contact.instance_id != instance.id {
            return Err(ServiceError::NotFound(format!(
                "contact {} on instance {}",
                contact.id, instance.id
            )));
        }

        let (content, metadata) = match request.body {
            OutboundBody::Text { content } => {
                if content.trim().is_empty() {
                    return Err(ServiceError::validation("content must not be empty"));
                }
                (content, None)
            }
            OutboundBody::Template {
                template_id,
                variables,
            } => {
                let rendered = self
                    .templates
                    .render(&template_id, &instance.school_id, &variables)
                    .await?;
                (rendered, Some(json!({ "templateId": template_id })))
            }
        };

        let (pending, _) = self
            .db
            .insert_message(&NewMessage {
                instance_id: instance.id.clone(),
                contact_id: contact.id,
                direction: Direction::Outbound,
                content: Some(content.clone()),
                media_url: None,
                media_mime: None,
                status: MessageStatus::Pending,
                external_id: None,
                timestamp: Utc::now().timestamp(),
                metadata,
            })
            .await?;
        self.db
            .touch_contact_activity(contact.id, pending.timestamp)
            .await?;
        self.cache.invalidate(&instance.id);

        let sent = bounded(
            self.config.gateway_timeout,
            self.gateway
                .send_message(&credentials(&instance), &contact.wa_id, &content),
        )
        .await;

        let message = match sent {
            Ok(sent) => match self.db.mark_outbound_sent(pending.id, &sent.external_id).await {
                Ok(message) => message,
                Err(DbError::Conflict(_)) => {
                    // The webhook echo of this send won the race and is already
                    // stored under the same external id.
                    let echoed = self
                        .db
                        .find_message_by_external_id(&instance.id, &sent.external_id)
                        .await?;
                    self.db.mark_superseded(pending.id, &sent.external_id).await?;
                    echoed.ok_or_else(|| {
                        ServiceError::Conflict(format!("external id {} vanished", sent.external_id))
                    })?
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) => {
                warn!(message_id = pending.id, error = %e, "Gateway rejected outbound message");
                self.db.mark_message_failed(pending.id, &e.to_string()).await?;
                self.cache.invalidate(&instance.id);
                return Err(e.into());
            }
        };

        self.cache.invalidate(&instance.id);
        info!(message_id = message.id, external_id = ?message.external_id, "Message sent");
        let _ = self.events.send(WorkerEvent::MessageStatusChanged {
            instance_id: instance.id,
            message_id: message.id,
            status: message.status,
        });
        Ok(message)
    }
}
