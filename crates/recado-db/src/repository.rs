use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use recado_core::template::derive_variables;
use recado_core::{ContactIdentity, MessageStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::error::{DbError, Result, conflict_on_unique};
use crate::models::{
    Contact, Conversation, Instance, InstanceConfigUpdate, LastMessageRow, Message, NewInstance,
    NewMessage, NewTemplate, StatusUpdateOutcome, Template, TemplatePatch,
};
use crate::schema::SCHEMA;

/// Rows retired by [`RecadoDb::mark_superseded`] stay stored but are never listed.
const NOT_SUPERSEDED: &str = "json_extract(COALESCE(metadata, '{}'), '$.supersededBy') IS NULL";

/// Messages table rank of a status within the forward order; `failed` has none.
const STATUS_RANK: &str = "CASE {col} WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 \
                           WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 END";

pub struct RecadoDb {
    pool: Pool<Sqlite>,
}

impl RecadoDb {
    /// Opens the database in the platform data directory.
    pub async fn new() -> Result<Self> {
        let db_path = Self::default_db_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db = Self::new_with_path(&db_path).await?;
        tracing::info!("Database initialized at: {}", db_path.display());
        Ok(db)
    }

    pub async fn new_with_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn default_db_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com.br", "recado", "recado").ok_or(DbError::NoDataDir)?;
        Ok(dirs.data_dir().join("recado.db"))
    }

    // Instances

    pub async fn create_instance(&self, new: &NewInstance) -> Result<Instance> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_now();

        sqlx::query(
            r#"INSERT INTO instances
               (id, school_id, name, gateway_instance_id, gateway_token, webhook_url, webhook_secret, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&new.school_id)
        .bind(&new.name)
        .bind(&new.gateway_instance_id)
        .bind(&new.gateway_token)
        .bind(&new.webhook_url)
        .bind(&new.webhook_secret)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("school {} already has an active instance", new.school_id)
            })
        })?;

        self.get_instance(&id).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.find_instance(id)
            .await?
            .ok_or_else(|| DbError::InstanceNotFound(id.to_string()))
    }

    pub async fn find_instance(&self, id: &str) -> Result<Option<Instance>> {
        Ok(sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn active_instance_for_school(&self, school_id: &str) -> Result<Option<Instance>> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE school_id = ? AND is_active = 1",
        )
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_instances(&self, active_only: bool) -> Result<Vec<Instance>> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE (? = 0 OR is_active = 1) ORDER BY created_at",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn update_instance_config(
        &self,
        id: &str,
        update: &InstanceConfigUpdate,
    ) -> Result<Instance> {
        let result = sqlx::query(
            r#"UPDATE instances SET
                 name = COALESCE(?, name),
                 gateway_instance_id = COALESCE(?, gateway_instance_id),
                 gateway_token = COALESCE(?, gateway_token),
                 webhook_url = COALESCE(?, webhook_url),
                 webhook_secret = COALESCE(?, webhook_secret),
                 updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&update.name)
        .bind(&update.gateway_instance_id)
        .bind(&update.gateway_token)
        .bind(&update.webhook_url)
        .bind(&update.webhook_secret)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::InstanceNotFound(id.to_string()));
        }
        self.get_instance(id).await
    }

    /// Stores a freshly issued QR and moves the instance to `connecting`.
    pub async fn mark_connecting(
        &self,
        id: &str,
        qr_payload: &str,
        issued_at: i64,
        expires_at: i64,
        attempts: i64,
    ) -> Result<Instance> {
        self.transition(
            id,
            sqlx::query(
                r#"UPDATE instances SET
                     status = 'connecting', qr_payload = ?, qr_issued_at = ?, qr_expires_at = ?,
                     qr_attempts = ?, last_error = NULL, updated_at = ?
                   WHERE id = ? AND is_active = 1"#,
            )
            .bind(qr_payload)
            .bind(issued_at)
            .bind(expires_at)
            .bind(attempts)
            .bind(unix_now())
            .bind(id),
        )
        .await
    }

    pub async fn mark_connected(&self, id: &str, phone_number: Option<&str>) -> Result<Instance> {
        let now = unix_now();
        self.transition(
            id,
            sqlx::query(
                r#"UPDATE instances SET
                     status = 'connected', phone_number = COALESCE(?, phone_number),
                     qr_payload = NULL, qr_issued_at = NULL, qr_expires_at = NULL, qr_attempts = 0,
                     last_connected_at = ?, last_error = NULL, updated_at = ?
                   WHERE id = ? AND is_active = 1"#,
            )
            .bind(phone_number)
            .bind(now)
            .bind(now)
            .bind(id),
        )
        .await
    }

    pub async fn mark_disconnected(&self, id: &str) -> Result<Instance> {
        self.transition(
            id,
            sqlx::query(
                r#"UPDATE instances SET
                     status = 'disconnected', qr_payload = NULL, qr_issued_at = NULL,
                     qr_expires_at = NULL, qr_attempts = 0, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(unix_now())
            .bind(id),
        )
        .await
    }

    pub async fn mark_error(&self, id: &str, reason: &str) -> Result<Instance> {
        self.transition(
            id,
            sqlx::query(
                r#"UPDATE instances SET
                     status = 'error', qr_payload = NULL, qr_issued_at = NULL,
                     qr_expires_at = NULL, last_error = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(reason)
            .bind(unix_now())
            .bind(id),
        )
        .await
    }

    /// Marks the instance inactive; rows are never deleted.
    pub async fn deactivate_instance(&self, id: &str) -> Result<Instance> {
        self.transition(
            id,
            sqlx::query(
                r#"UPDATE instances SET
                     is_active = 0, status = 'disconnected', qr_payload = NULL,
                     qr_issued_at = NULL, qr_expires_at = NULL, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(unix_now())
            .bind(id),
        )
        .await
    }

    async fn transition<'q>(
        &self,
        id: &str,
        query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<Instance> {
        let result = query.execute(&self.pool).await.map_err(|e| {
            conflict_on_unique(e, || format!("school of instance {id} already holds a session"))
        })?;
        if result.rows_affected() == 0 {
            return Err(DbError::InstanceNotFound(id.to_string()));
        }
        let instance = self.get_instance(id).await?;
        tracing::debug!(instance_id = %id, status = %instance.status, "Instance status stored");
        Ok(instance)
    }

    // Contacts

    /// Creates the contact or refreshes its name and phone. Activity is not touched here.
    pub async fn upsert_contact(&self, instance_id: &str, identity: &ContactIdentity) -> Result<Contact> {
        let now = unix_now();

        Ok(sqlx::query_as::<_, Contact>(
            r#"INSERT INTO contacts (instance_id, wa_id, name, phone, is_group, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, wa_id) DO UPDATE SET
                 name = COALESCE(excluded.name, name),
                 phone = COALESCE(excluded.phone, phone),
                 is_group = excluded.is_group,
                 updated_at = excluded.updated_at
               RETURNING *"#,
        )
        .bind(instance_id)
        .bind(&identity.wa_id)
        .bind(&identity.name)
        .bind(&identity.phone)
        .bind(identity.is_group)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn touch_contact_activity(&self, contact_id: i64, at: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE contacts SET
                 last_activity_at = MAX(COALESCE(last_activity_at, 0), ?), updated_at = ?
               WHERE id = ?"#,
        )
        .bind(at)
        .bind(unix_now())
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_contact(&self, id: i64) -> Result<Contact> {
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::ContactNotFound(id))
    }

    pub async fn get_contacts(&self, instance_id: &str) -> Result<Vec<Contact>> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE instance_id = ? ORDER BY last_activity_at DESC, name",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn link_contact(
        &self,
        id: i64,
        lead_id: Option<&str>,
        student_id: Option<&str>,
    ) -> Result<Contact> {
        let result = sqlx::query(
            r#"UPDATE contacts SET
                 lead_id = COALESCE(?, lead_id), student_id = COALESCE(?, student_id), updated_at = ?
               WHERE id = ?"#,
        )
        .bind(lead_id)
        .bind(student_id)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::ContactNotFound(id));
        }
        self.get_contact(id).await
    }

    // Messages

    /// Inserts the message unless one with the same external id already exists.
    ///
    /// Returns the stored row and whether this call created it. The unique
    /// `(instance_id, external_id)` constraint makes this safe under concurrent
    /// delivery of the same event.
    pub async fn insert_message(&self, new: &NewMessage) -> Result<(Message, bool)> {
        let now = unix_now();
        let metadata = new.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let sent_at = matches!(new.status, MessageStatus::Sent).then_some(new.timestamp);
        let delivered_at = matches!(new.status, MessageStatus::Delivered).then_some(new.timestamp);

        let inserted = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages
               (instance_id, contact_id, direction, content, media_url, media_mime, status,
                external_id, timestamp, sent_at, delivered_at, metadata, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, external_id) DO NOTHING
               RETURNING *"#,
        )
        .bind(&new.instance_id)
        .bind(new.contact_id)
        .bind(new.direction)
        .bind(&new.content)
        .bind(&new.media_url)
        .bind(&new.media_mime)
        .bind(new.status)
        .bind(&new.external_id)
        .bind(new.timestamp)
        .bind(sent_at)
        .bind(delivered_at)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = inserted {
            return Ok((message, true));
        }

        let external_id = new.external_id.as_deref().unwrap_or_default();
        let existing = self
            .find_message_by_external_id(&new.instance_id, external_id)
            .await?
            .ok_or_else(|| DbError::Conflict(format!("message {external_id} vanished after conflict")))?;
        Ok((existing, false))
    }

    pub async fn get_message(&self, id: i64) -> Result<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::MessageNotFound(id))
    }

    pub async fn find_message_by_external_id(
        &self,
        instance_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>> {
        Ok(sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE instance_id = ? AND external_id = ?",
        )
        .bind(instance_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Records the gateway acknowledgement of a provisional outbound message.
    pub async fn mark_outbound_sent(&self, id: i64, external_id: &str) -> Result<Message> {
        let now = unix_now();
        let result = sqlx::query(
            r#"UPDATE messages SET
                 external_id = ?, status = 'sent', sent_at = ?, updated_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(external_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("external id {external_id} already stored")))?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id = id, "Outbound message was no longer pending");
        }
        self.get_message(id).await
    }

    /// Retires a provisional outbound row whose webhook echo was stored first
    /// under `external_id`. The row is kept but drops out of threads and
    /// conversation listings.
    pub async fn mark_superseded(&self, id: i64, external_id: &str) -> Result<Message> {
        sqlx::query(
            r#"UPDATE messages SET
                 status = 'failed',
                 metadata = json_set(COALESCE(metadata, '{}'), '$.supersededBy', ?),
                 updated_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(external_id)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_message(id).await
    }

    /// Moves a message to `failed` unless it already reached a terminal state.
    pub async fn mark_message_failed(&self, id: i64, reason: &str) -> Result<Message> {
        sqlx::query(
            r#"UPDATE messages SET
                 status = 'failed',
                 metadata = json_set(COALESCE(metadata, '{}'), '$.error', ?),
                 updated_at = ?
               WHERE id = ? AND status NOT IN ('read', 'failed')"#,
        )
        .bind(reason)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_message(id).await
    }

    /// Applies a gateway status event if it moves the message forward.
    ///
    /// The check and the write happen in a single statement so concurrent
    /// events for the same external id cannot interleave.
    pub async fn apply_status_update(
        &self,
        instance_id: &str,
        external_id: &str,
        status: MessageStatus,
        at: i64,
    ) -> Result<StatusUpdateOutcome> {
        let sql = format!(
            r#"UPDATE messages SET
                 status = ?1,
                 sent_at = CASE WHEN ?1 = 'sent' THEN COALESCE(sent_at, ?2) ELSE sent_at END,
                 delivered_at = CASE WHEN ?1 = 'delivered' THEN COALESCE(delivered_at, ?2) ELSE delivered_at END,
                 read_at = CASE WHEN ?1 = 'read' THEN COALESCE(read_at, ?2) ELSE read_at END,
                 updated_at = ?3
               WHERE instance_id = ?4 AND external_id = ?5
                 AND status NOT IN ('read', 'failed')
                 AND (?1 = 'failed' OR ({current}) < ({next}))"#,
            current = STATUS_RANK.replace("{col}", "status"),
            next = STATUS_RANK.replace("{col}", "?1"),
        );

        let result = sqlx::query(&sql)
            .bind(status)
            .bind(at)
            .bind(unix_now())
            .bind(instance_id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;

        let message = self.find_message_by_external_id(instance_id, external_id).await?;
        Ok(match (message, result.rows_affected()) {
            (None, _) => StatusUpdateOutcome::Unknown,
            (Some(message), 0) => StatusUpdateOutcome::Ignored(message),
            (Some(message), _) => StatusUpdateOutcome::Applied(message),
        })
    }

    /// A page of a contact's thread in chronological order.
    pub async fn get_thread(&self, contact_id: i64, limit: i64, offset: i64) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT * FROM messages WHERE contact_id = ? AND {NOT_SUPERSEDED} \
             ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut messages = sqlx::query_as::<_, Message>(&sql)
            .bind(contact_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        messages.reverse();
        Ok(messages)
    }

    /// Latest message and unread count per contact, most recent first.
    ///
    /// Contacts without messages never appear.
    pub async fn list_conversations(&self, instance_id: &str) -> Result<Vec<Conversation>> {
        let sql = format!(
            r#"WITH ranked AS (
                   SELECT m.*, ROW_NUMBER() OVER (
                       PARTITION BY m.contact_id ORDER BY m.timestamp DESC, m.id DESC
                   ) AS rn
                   FROM messages m
                   WHERE m.instance_id = ?1 AND {NOT_SUPERSEDED}
               ),
               unread AS (
                   SELECT contact_id, COUNT(*) AS unread_count
                   FROM messages
                   WHERE instance_id = ?1 AND direction = 'inbound'
                     AND status IN ('sent', 'delivered')
                   GROUP BY contact_id
               )
               SELECT ranked.*, COALESCE(unread.unread_count, 0) AS unread_count
               FROM ranked
               LEFT JOIN unread ON unread.contact_id = ranked.contact_id
               WHERE ranked.rn = 1
               ORDER BY ranked.timestamp DESC, ranked.id DESC"#
        );
        let rows = sqlx::query_as::<_, LastMessageRow>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;

        let mut contacts: HashMap<i64, Contact> = self
            .get_contacts(instance_id)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let contact = contacts.remove(&row.message.contact_id)?;
                Some(Conversation {
                    contact,
                    last_message: row.message,
                    unread_count: row.unread_count,
                })
            })
            .collect())
    }

    /// Marks inbound unread messages of a contact as read, up to and including
    /// `up_to_message_id` when given. Returns how many rows changed.
    pub async fn mark_read(&self, contact_id: i64, up_to_message_id: Option<i64>) -> Result<u64> {
        let now = unix_now();
        let result = sqlx::query(
            r#"UPDATE messages SET status = 'read', read_at = ?1, updated_at = ?1
               WHERE contact_id = ?2 AND direction = 'inbound'
                 AND status IN ('sent', 'delivered')
                 AND (?3 IS NULL OR timestamp <= (
                     SELECT timestamp FROM messages WHERE id = ?3 AND contact_id = ?2
                 ))"#,
        )
        .bind(now)
        .bind(contact_id)
        .bind(up_to_message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // Templates

    pub async fn create_template(&self, new: &NewTemplate) -> Result<Template> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_now();
        let variables = serde_json::to_string(&derive_variables(&new.content, &new.variables))?;

        sqlx::query(
            r#"INSERT INTO templates (id, school_id, name, category, content, variables_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&new.school_id)
        .bind(&new.name)
        .bind(&new.category)
        .bind(&new.content)
        .bind(variables)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_template(&id).await
    }

    pub async fn get_template(&self, id: &str) -> Result<Template> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::TemplateNotFound(id.to_string()))
    }

    /// Active global templates plus the active ones owned by `school_id`.
    pub async fn list_templates(&self, school_id: Option<&str>) -> Result<Vec<Template>> {
        Ok(sqlx::query_as::<_, Template>(
            r#"SELECT * FROM templates
               WHERE is_active = 1 AND (school_id IS NULL OR school_id = ?)
               ORDER BY category, name"#,
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Updates a template, re-deriving its variables from the resulting content.
    pub async fn update_template(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        let current = self.get_template(id).await?;
        let content = patch.content.clone().unwrap_or(current.content.clone());
        let declared = patch.variables.clone().unwrap_or_else(|| current.variables());
        let variables = serde_json::to_string(&derive_variables(&content, &declared))?;

        sqlx::query(
            r#"UPDATE templates SET
                 name = COALESCE(?, name), category = COALESCE(?, category),
                 content = ?, variables_json = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&patch.name)
        .bind(&patch.category)
        .bind(&content)
        .bind(variables)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_template(id).await
    }

    pub async fn deactivate_template(&self, id: &str) -> Result<Template> {
        let result = sqlx::query("UPDATE templates SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::TemplateNotFound(id.to_string()));
        }
        self.get_template(id).await
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recado_core::Direction;

    async fn setup() -> (RecadoDb, Instance) {
        let db = RecadoDb::in_memory().await.unwrap();
        let instance = db
            .create_instance(&NewInstance {
                school_id: "school-1".into(),
                name: "Escola Central".into(),
                gateway_instance_id: "gw-1".into(),
                gateway_token: "token".into(),
                webhook_url: None,
                webhook_secret: None,
            })
            .await
            .unwrap();
        (db, instance)
    }

    fn identity(wa_id: &str) -> ContactIdentity {
        ContactIdentity {
            wa_id: wa_id.into(),
            name: None,
            phone: None,
            is_group: false,
        }
    }

    fn inbound(instance: &Instance, contact_id: i64, external_id: &str, ts: i64) -> NewMessage {
        NewMessage {
            instance_id: instance.id.clone(),
            contact_id,
            direction: Direction::Inbound,
            content: Some(format!("msg {external_id}")),
            media_url: None,
            media_mime: None,
            status: MessageStatus::Delivered,
            external_id: Some(external_id.into()),
            timestamp: ts,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn second_active_instance_for_school_conflicts() {
        let (db, instance) = setup().await;
        let err = db
            .create_instance(&NewInstance {
                school_id: instance.school_id.clone(),
                name: "Outra".into(),
                gateway_instance_id: "gw-2".into(),
                gateway_token: "t".into(),
                webhook_url: None,
                webhook_secret: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        db.deactivate_instance(&instance.id).await.unwrap();
        let found = db.active_instance_for_school(&instance.school_id).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn upsert_contact_keeps_known_fields() {
        let (db, instance) = setup().await;
        let mut ana = identity("5511999999999");
        ana.name = Some("Ana".into());
        let first = db.upsert_contact(&instance.id, &ana).await.unwrap();

        let second = db.upsert_contact(&instance.id, &identity("5511999999999")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn duplicate_external_id_is_not_inserted_twice() {
        let (db, instance) = setup().await;
        let contact = db.upsert_contact(&instance.id, &identity("551100")).await.unwrap();

        let (first, created) = db.insert_message(&inbound(&instance, contact.id, "wamid.1", 10)).await.unwrap();
        assert!(created);

        let mut replay = inbound(&instance, contact.id, "wamid.1", 10);
        replay.content = Some("different".into());
        let (second, created) = db.insert_message(&replay).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.content.as_deref(), Some("msg wamid.1"));
    }

    #[tokio::test]
    async fn status_updates_only_move_forward() {
        let (db, instance) = setup().await;
        let contact = db.upsert_contact(&instance.id, &identity("551100")).await.unwrap();
        let mut outbound = inbound(&instance, contact.id, "wamid.out", 10);
        outbound.direction = Direction::Outbound;
        outbound.status = MessageStatus::Sent;
        db.insert_message(&outbound).await.unwrap();

        let read = db
            .apply_status_update(&instance.id, "wamid.out", MessageStatus::Read, 30)
            .await
            .unwrap();
        assert!(matches!(read, StatusUpdateOutcome::Applied(ref m) if m.read_at == Some(30)));

        let late = db
            .apply_status_update(&instance.id, "wamid.out", MessageStatus::Delivered, 20)
            .await
            .unwrap();
        let StatusUpdateOutcome::Ignored(message) = late else {
            panic!("regression must be ignored");
        };
        assert_eq!(message.status, MessageStatus::Read);
        assert_eq!(message.delivered_at, None);

        let unknown = db
            .apply_status_update(&instance.id, "wamid.nope", MessageStatus::Read, 30)
            .await
            .unwrap();
        assert!(matches!(unknown, StatusUpdateOutcome::Unknown));
    }

    #[tokio::test]
    async fn conversations_list_latest_message_and_unread() {
        let (db, instance) = setup().await;
        let ana = db.upsert_contact(&instance.id, &identity("a")).await.unwrap();
        let bia = db.upsert_contact(&instance.id, &identity("b")).await.unwrap();
        db.upsert_contact(&instance.id, &identity("silent")).await.unwrap();

        db.insert_message(&inbound(&instance, ana.id, "1", 10)).await.unwrap();
        db.insert_message(&inbound(&instance, ana.id, "2", 30)).await.unwrap();
        db.insert_message(&inbound(&instance, bia.id, "3", 20)).await.unwrap();

        let conversations = db.list_conversations(&instance.id).await.unwrap();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].contact.id, ana.id);
        assert_eq!(conversations[0].last_message.external_id.as_deref(), Some("2"));
        assert_eq!(conversations[0].unread_count, 2);
        assert_eq!(conversations[1].contact.id, bia.id);

        assert_eq!(db.mark_read(ana.id, None).await.unwrap(), 2);
        assert_eq!(db.mark_read(ana.id, None).await.unwrap(), 0);
        let conversations = db.list_conversations(&instance.id).await.unwrap();
        assert_eq!(conversations[0].unread_count, 0);
    }

    #[tokio::test]
    async fn pending_inbound_is_not_unread() {
        let (db, instance) = setup().await;
        let ana = db.upsert_contact(&instance.id, &identity("a")).await.unwrap();
        let mut pending = inbound(&instance, ana.id, "1", 10);
        pending.status = MessageStatus::Pending;
        db.insert_message(&pending).await.unwrap();
        db.insert_message(&inbound(&instance, ana.id, "2", 20)).await.unwrap();

        let conversations = db.list_conversations(&instance.id).await.unwrap();
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(db.mark_read(ana.id, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn superseded_rows_are_hidden() {
        let (db, instance) = setup().await;
        let ana = db.upsert_contact(&instance.id, &identity("a")).await.unwrap();
        let mut provisional = inbound(&instance, ana.id, "unused", 30);
        provisional.direction = Direction::Outbound;
        provisional.status = MessageStatus::Pending;
        provisional.external_id = None;
        let (provisional, _) = db.insert_message(&provisional).await.unwrap();
        db.insert_message(&inbound(&instance, ana.id, "wamid.echo", 20)).await.unwrap();

        let retired = db.mark_superseded(provisional.id, "wamid.echo").await.unwrap();
        assert_eq!(retired.status, MessageStatus::Failed);
        assert!(retired.metadata.unwrap().contains("wamid.echo"));

        let thread = db.get_thread(ana.id, 50, 0).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].external_id.as_deref(), Some("wamid.echo"));

        let conversations = db.list_conversations(&instance.id).await.unwrap();
        assert_eq!(conversations[0].last_message.external_id.as_deref(), Some("wamid.echo"));
    }

    #[tokio::test]
    async fn template_variables_follow_content() {
        let (db, _) = setup().await;
        let template = db
            .create_template(&NewTemplate {
                school_id: None,
                name: "boas-vindas".into(),
                category: "matricula".into(),
                content: "Olá {{name}}".into(),
                variables: vec![],
            })
            .await
            .unwrap();
        assert_eq!(template.variables().len(), 1);

        let updated = db
            .update_template(
                &template.id,
                &TemplatePatch {
                    content: Some("{{course}} confirmado, {{name}}".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<String> = updated.variables().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["course", "name"]);
    }
}
