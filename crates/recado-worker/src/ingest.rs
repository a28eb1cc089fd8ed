use std::sync::Arc;

use recado_core::{Direction, MessageStatus, NewMessageEvent, StatusUpdateEvent};
use recado_db::{Instance, Message, NewMessage, RecadoDb, StatusUpdateOutcome};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::ConversationCache;
use crate::error::Result;
use crate::events::WorkerEvent;

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Stored(Message),
    /// Same external id already on file; nothing changed.
    Duplicate(Message),
    StatusApplied(Message),
    /// The status would not move the message forward.
    StatusIgnored(Message),
    /// A status event for a message this service never saw.
    UnknownMessage,
    /// A connection update, applied by the connection manager.
    Connection(Instance),
}

/// Turns gateway message and status events into stored state.
///
/// Safe under duplicate, concurrent and out-of-order delivery: inserts are
/// keyed on `(instance, external id)` and status changes are forward-only.
#[derive(Clone)]
pub struct IngestionPipeline {
    db: Arc<RecadoDb>,
    cache: Arc<ConversationCache>,
    events: broadcast::Sender<WorkerEvent>,
}

impl IngestionPipeline {
    pub(crate) fn new(
        db: Arc<RecadoDb>,
        cache: Arc<ConversationCache>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self { db, cache, events }
    }

    pub async fn ingest_message(
        &self,
        instance: &Instance,
        event: NewMessageEvent,
    ) -> Result<IngestOutcome> {
        let contact = self.db.upsert_contact(&instance.id, &event.contact).await?;

        // Echoes of our own sends arrive already accepted by the gateway.
        let status = match event.direction {
            Direction::Inbound => MessageStatus::Delivered,
            Direction::Outbound => MessageStatus::Sent,
        };
        let (media_url, media_mime) = match event.media {
            Some(media) => (Some(media.url), media.mime_type),
            None => (None, None),
        };

        let new = NewMessage {
            instance_id: instance.id.clone(),
            contact_id: contact.id,
            direction: event.direction,
            content: event.content,
            media_url,
            media_mime,
            status,
            external_id: Some(event.external_id),
            timestamp: event.timestamp,
            metadata: event.metadata,
        };

        let (message, created) = self.db.insert_message(&new).await?;
        if !created {
            debug!(
                instance_id = %instance.id,
                external_id = ?message.external_id,
                "Duplicate message event ignored"
            );
            return Ok(IngestOutcome::Duplicate(message));
        }

        self.db
            .touch_contact_activity(contact.id, message.timestamp)
            .await?;
        self.cache.invalidate(&instance.id);
        info!(
            instance_id = %instance.id,
            contact_id = contact.id,
            message_id = message.id,
            direction = message.direction.as_str(),
            "Message stored"
        );

        let _ = self.events.send(WorkerEvent::MessageReceived {
            instance_id: instance.id.clone(),
            contact_id: contact.id,
            message_id: message.id,
        });
        Ok(IngestOutcome::Stored(message))
    }

    pub async fn ingest_status(
        &self,
        instance: &Instance,
        event: StatusUpdateEvent,
    ) -> Result<IngestOutcome> {
        let outcome = self
            .db
            .apply_status_update(&instance.id, &event.external_id, event.status, event.timestamp)
            .await?;

        Ok(match outcome {
            StatusUpdateOutcome::Applied(message) => {
                self.cache.invalidate(&instance.id);
                debug!(message_id = message.id, status = %message.status, "Message status advanced");
                let _ = self.events.send(WorkerEvent::MessageStatusChanged {
                    instance_id: instance.id.clone(),
                    message_id: message.id,
                    status: message.status,
                });
                IngestOutcome::StatusApplied(message)
            }
            StatusUpdateOutcome::Ignored(message) => {
                debug!(
                    message_id = message.id,
                    current = %message.status,
                    received = %event.status,
                    "Stale status event ignored"
                );
                IngestOutcome::StatusIgnored(message)
            }
            StatusUpdateOutcome::Unknown => {
                warn!(
                    instance_id = %instance.id,
                    external_id = %event.external_id,
                    "Status event for unknown message dropped"
                );
                IngestOutcome::UnknownMessage
            }
        })
    }
}
