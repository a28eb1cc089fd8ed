use std::sync::Arc;

use chrono::Utc;
use recado_core::{Direction, MessageStatus};
use recado_db::{Contact, Conversation, Instance, Message, RecadoDb};
use tracing::{debug, warn};

use crate::cache::ConversationCache;
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::scope::ViewerScope;

const MAX_PAGE_SIZE: i64 = 200;

/// Read side of the inbox: conversation lists, threads and read receipts,
/// all scoped to what the viewer may see.
#[derive(Clone)]
pub struct ConversationAggregator {
    db: Arc<RecadoDb>,
    cache: Arc<ConversationCache>,
    config: Arc<ServiceConfig>,
}

impl ConversationAggregator {
    pub(crate) fn new(
        db: Arc<RecadoDb>,
        cache: Arc<ConversationCache>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self { db, cache, config }
    }

    /// Picks the instance a viewer is asking about.
    ///
    /// Schools default to their active instance; admins must name one.
    pub async fn resolve_instance(
        &self,
        viewer: &ViewerScope,
        instance_id: Option<&str>,
    ) -> Result<Instance> {
        match (viewer, instance_id) {
            (_, Some(id)) => {
                let instance = self.db.get_instance(id).await?;
                if !viewer.can_view(&instance) {
                    return Err(ServiceError::NotFound(format!("instance {id}")));
                }
                Ok(instance)
            }
            (ViewerScope::School(school_id), None) => self
                .db
                .active_instance_for_school(school_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("school {school_id} has no instance"))),
            (ViewerScope::Admin, None) => Err(ServiceError::validation(
                "instanceId is required for admin viewers",
            )),
        }
    }

    /// One entry per contact with messages, most recent activity first.
    pub async fn list_conversations(
        &self,
        viewer: &ViewerScope,
        instance_id: Option<&str>,
    ) -> Result<Vec<Conversation>> {
        let instance = self.resolve_instance(viewer, instance_id).await?;
        let key = self.cache.key(&instance.id);

        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_value(cached) {
                Ok(conversations) => return Ok(conversations),
                Err(e) => warn!(key = %key, error = %e, "Discarding unreadable cache entry"),
            }
        }

        let conversations = self.db.list_conversations(&instance.id).await?;
        match serde_json::to_value(&conversations) {
            Ok(value) => self.cache.store(&key, value),
            Err(e) => warn!(key = %key, error = %e, "Conversations not cached"),
        }
        Ok(conversations)
    }

    /// A page of the thread, oldest first. Opening it marks what it shows as read.
    pub async fn open_thread(
        &self,
        viewer: &ViewerScope,
        contact_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Message>> {
        let contact = self.visible_contact(viewer, contact_id).await?;
        let limit = limit.unwrap_or(self.config.thread_page_size);
        let offset = offset.unwrap_or(0);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if offset < 0 {
            return Err(ServiceError::validation("offset must not be negative"));
        }

        let mut messages = self.db.get_thread(contact.id, limit, offset).await?;
        let Some(newest) = messages.last().map(|m| m.id) else {
            return Ok(messages);
        };

        if self.mark_contact_read(&contact, Some(newest)).await? > 0 {
            let now = Utc::now().timestamp();
            for message in messages
                .iter_mut()
                .filter(|m| m.direction == Direction::Inbound && m.status.is_unread())
            {
                message.status = MessageStatus::Read;
                message.read_at = Some(now);
            }
        }
        Ok(messages)
    }

    /// Marks inbound messages read, optionally only up to one message.
    /// Returns how many changed; repeating the call changes nothing.
    pub async fn mark_read(
        &self,
        viewer: &ViewerScope,
        contact_id: i64,
        up_to_message_id: Option<i64>,
    ) -> Result<u64> {
        let contact = self.visible_contact(viewer, contact_id).await?;
        if let Some(message_id) = up_to_message_id {
            let message = self.db.get_message(message_id).await?;
            if message.contact_id != contact.id {
                return Err(ServiceError::NotFound(format!(
                    "message {message_id} in conversation {contact_id}"
                )));
            }
        }
        self.mark_contact_read(&contact, up_to_message_id).await
    }

    pub async fn contacts(
        &self,
        viewer: &ViewerScope,
        instance_id: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let instance = self.resolve_instance(viewer, instance_id).await?;
        Ok(self.db.get_contacts(&instance.id).await?)
    }

    /// Ties a contact to a lead or student record.
    pub async fn link_contact(
        &self,
        viewer: &ViewerScope,
        contact_id: i64,
        lead_id: Option<&str>,
        student_id: Option<&str>,
    ) -> Result<Contact> {
        if lead_id.is_none() && student_id.is_none() {
            return Err(ServiceError::validation("leadId or studentId is required"));
        }
        let contact = self.visible_contact(viewer, contact_id).await?;
        let linked = self.db.link_contact(contact.id, lead_id, student_id).await?;
        self.cache.invalidate(&linked.instance_id);
        Ok(linked)
    }

    async fn mark_contact_read(&self, contact: &Contact, up_to: Option<i64>) -> Result<u64> {
        let marked = self.db.mark_read(contact.id, up_to).await?;
        if marked > 0 {
            self.cache.invalidate(&contact.instance_id);
            debug!(contact_id = contact.id, marked, "Messages marked read");
        }
        Ok(marked)
    }

    /// Contacts of other schools look exactly like missing ones.
    async fn visible_contact(&self, viewer: &ViewerScope, contact_id: i64) -> Result<Contact> {
        let contact = self.db.get_contact(contact_id).await?;
        if let ViewerScope::School(_) = viewer {
            let instance = self.db.get_instance(&contact.instance_id).await?;
            if !viewer.can_view(&instance) {
                return Err(ServiceError::NotFound(format!("contact {contact_id}")));
            }
        }
        Ok(contact)
    }
}
