use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the gateway needs to address one school's session.
#[derive(Clone, Serialize, Deserialize)]
pub struct InstanceCredentials {
    pub instance_id: String,
    pub token: String,
}

impl std::fmt::Debug for InstanceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCredentials")
            .field("instance_id", &self.instance_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub qr_payload: String,
    /// Unix seconds after which the QR can no longer be scanned.
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for the QR to be scanned.
    Pairing,
    Connected,
    Disconnected,
    /// The gateway gave up on the session and will not recover on its own.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub external_id: String,
}

/// The external messaging gateway. Every call is a network operation with a
/// bounded timeout; implementations surface timeouts as errors.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn start_session(&self, credentials: &InstanceCredentials) -> Result<SessionStart>;

    async fn get_status(&self, credentials: &InstanceCredentials) -> Result<SessionStatus>;

    async fn end_session(&self, credentials: &InstanceCredentials) -> Result<()>;

    async fn send_message(
        &self,
        credentials: &InstanceCredentials,
        contact_wa_id: &str,
        content: &str,
    ) -> Result<SentMessage>;
}
