use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::{Direction, MessageStatus};

/// Events pushed by the gateway webhook or produced by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Message(NewMessageEvent),
    Status(StatusUpdateEvent),
    Connection(ConnectionEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub instance_id: String,
    pub external_id: String,
    pub contact: ContactIdentity,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub content: Option<String>,
    pub media: Option<MediaRef>,
    pub timestamp: i64,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactIdentity {
    pub wa_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateEvent {
    pub instance_id: String,
    pub external_id: String,
    pub status: MessageStatus,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub instance_id: String,
    pub update: ConnectionUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionUpdate {
    #[serde(rename_all = "camelCase")]
    Connected { phone_number: Option<String> },
    Disconnected { reason: Option<String> },
    #[serde(rename_all = "camelCase")]
    Qr {
        payload: String,
        expires_at: Option<i64>,
    },
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("Message event carries neither content nor media")]
    EmptyMessage,
}

fn default_direction() -> Direction {
    Direction::Inbound
}

impl GatewayEvent {
    /// Parses and validates a raw webhook body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EventError> {
        let event: GatewayEvent = serde_json::from_slice(body)?;
        event.validate()?;
        Ok(event)
    }

    pub fn instance_id(&self) -> &str {
        match self {
            Self::Message(e) => &e.instance_id,
            Self::Status(e) => &e.instance_id,
            Self::Connection(e) => &e.instance_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Status(_) => "status",
            Self::Connection(_) => "connection",
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        require("instanceId", self.instance_id())?;
        match self {
            Self::Message(e) => {
                require("externalId", &e.external_id)?;
                require("contact.waId", &e.contact.wa_id)?;
                let has_content = e.content.as_deref().is_some_and(|c| !c.is_empty());
                if !has_content && e.media.is_none() {
                    return Err(EventError::EmptyMessage);
                }
            }
            Self::Status(e) => require("externalId", &e.external_id)?,
            Self::Connection(ConnectionEvent {
                update: ConnectionUpdate::Qr { payload, .. },
                ..
            }) => require("update.payload", payload)?,
            Self::Connection(_) => {}
        }
        Ok(())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        Err(EventError::EmptyField(field))
    } else {
        Ok(())
    }
}
