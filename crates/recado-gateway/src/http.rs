use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::{
    GatewayClient, InstanceCredentials, SentMessage, SessionStart, SessionState, SessionStatus,
};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// How long an issued QR stays scannable on the gateway side.
    pub qr_ttl: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            timeout: Duration::from_secs(10),
            qr_ttl: Duration::from_secs(20),
        }
    }
}

/// REST gateway addressed as `{base}/instances/{id}/token/{token}/{action}`.
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
}

#[derive(Deserialize)]
struct QrResponse {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    connected: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: Option<String>,
    id: Option<String>,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpGatewayConfig {
        &self.config
    }

    fn url(&self, credentials: &InstanceCredentials, action: &str) -> String {
        format!(
            "{}/instances/{}/token/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            credentials.instance_id,
            credentials.token,
            action
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        credentials: &InstanceCredentials,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        debug!(action, instance_id = %credentials.instance_id, "Calling gateway");

        let mut request = self.client.request(method, self.url(credentials, action));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.without_url().to_string()))
    }
}

/// The request URL carries the instance token, so it is stripped before the
/// error can reach logs or stored state.
fn map_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Http(err.without_url())
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn start_session(&self, credentials: &InstanceCredentials) -> Result<SessionStart> {
        let qr: QrResponse = self.call(Method::GET, credentials, "qr-code", None).await?;
        if qr.value.is_empty() {
            return Err(GatewayError::Decode("empty QR payload".to_string()));
        }

        let ttl = i64::try_from(self.config.qr_ttl.as_secs()).unwrap_or(i64::MAX);
        Ok(SessionStart {
            qr_payload: qr.value,
            expires_at: chrono::Utc::now().timestamp().saturating_add(ttl),
        })
    }

    async fn get_status(&self, credentials: &InstanceCredentials) -> Result<SessionStatus> {
        let status: StatusResponse = self.call(Method::GET, credentials, "status", None).await?;

        let state = match (status.connected, status.error) {
            (true, _) => SessionState::Connected,
            (false, Some(error)) if error.contains("restore") || error.contains("expired") => {
                SessionState::Failed(error)
            }
            (false, Some(_)) => SessionState::Pairing,
            (false, None) => SessionState::Disconnected,
        };

        Ok(SessionStatus {
            state,
            phone_number: status.phone,
        })
    }

    async fn end_session(&self, credentials: &InstanceCredentials) -> Result<()> {
        let _: serde_json::Value = self
            .call(Method::GET, credentials, "disconnect", None)
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        credentials: &InstanceCredentials,
        contact_wa_id: &str,
        content: &str,
    ) -> Result<SentMessage> {
        let body = serde_json::json!({ "phone": contact_wa_id, "message": content });
        let sent: SendResponse = self
            .call(Method::POST, credentials, "send-text", Some(body))
            .await?;

        sent.message_id
            .or(sent.id)
            .filter(|id| !id.is_empty())
            .map(|external_id| SentMessage { external_id })
            .ok_or_else(|| GatewayError::Decode("send response carries no message id".to_string()))
    }
}
