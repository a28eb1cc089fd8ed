use recado_core::{InstanceStatus, MessageStatus};
use serde::Serialize;

/// Notifications published by the worker as state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    InstanceStatusChanged {
        instance_id: String,
        status: InstanceStatus,
    },
    #[serde(rename_all = "camelCase")]
    QrIssued {
        instance_id: String,
        expires_at: i64,
        attempt: i64,
    },
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        instance_id: String,
        contact_id: i64,
        message_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    MessageStatusChanged {
        instance_id: String,
        message_id: i64,
        status: MessageStatus,
    },
}
