#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recado_core::{ConnectionUpdate, ContactIdentity, Direction, GatewayEvent, NewMessageEvent};
use recado_db::NewInstance;
use recado_gateway::{
    GatewayClient, GatewayError, InstanceCredentials, SentMessage, SessionStart, SessionState,
    SessionStatus,
};
use recado_worker::{Instance, RecadoDb, RecadoWorker, ServiceConfig, ViewerScope};

/// Gateway double whose answers are scripted per test.
pub struct FakeGateway {
    pub state: Mutex<SessionState>,
    pub phone: Mutex<Option<String>>,
    /// Seconds a fresh QR stays valid; negative issues already-expired codes.
    pub qr_ttl: Mutex<i64>,
    pub send_delay: Mutex<Option<Duration>>,
    pub fail_start: AtomicBool,
    pub fail_end: AtomicBool,
    pub fail_send: AtomicBool,
    pub sessions_started: AtomicUsize,
    pub sessions_ended: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            state: Mutex::new(SessionState::Pairing),
            phone: Mutex::new(None),
            qr_ttl: Mutex::new(60),
            send_delay: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            fail_end: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            sessions_started: AtomicUsize::new(0),
            sessions_ended: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGateway {
    pub fn pair(&self, phone: &str) {
        *self.state.lock().unwrap() = SessionState::Connected;
        *self.phone.lock().unwrap() = Some(phone.to_string());
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn start_session(
        &self,
        _credentials: &InstanceCredentials,
    ) -> recado_gateway::Result<SessionStart> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 401,
                body: "invalid token".to_string(),
            });
        }
        let n = self.sessions_started.fetch_add(1, Ordering::SeqCst) + 1;
        let ttl = *self.qr_ttl.lock().unwrap();
        Ok(SessionStart {
            qr_payload: format!("qr-{n}"),
            expires_at: chrono::Utc::now().timestamp() + ttl,
        })
    }

    async fn get_status(
        &self,
        _credentials: &InstanceCredentials,
    ) -> recado_gateway::Result<SessionStatus> {
        Ok(SessionStatus {
            state: self.state.lock().unwrap().clone(),
            phone_number: self.phone.lock().unwrap().clone(),
        })
    }

    async fn end_session(&self, _credentials: &InstanceCredentials) -> recado_gateway::Result<()> {
        self.sessions_ended.fetch_add(1, Ordering::SeqCst);
        if self.fail_end.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        *self.state.lock().unwrap() = SessionState::Disconnected;
        Ok(())
    }

    async fn send_message(
        &self,
        _credentials: &InstanceCredentials,
        contact_wa_id: &str,
        content: &str,
    ) -> recado_gateway::Result<SentMessage> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 502,
                body: "upstream down".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((contact_wa_id.to_string(), content.to_string()));
        Ok(SentMessage {
            external_id: format!("wamid.out-{}", sent.len()),
        })
    }
}

pub struct Harness {
    pub db: Arc<RecadoDb>,
    pub gateway: Arc<FakeGateway>,
    pub worker: RecadoWorker,
    pub instance: Instance,
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        poll_interval: Duration::from_millis(20),
        gateway_timeout: Duration::from_millis(500),
        ..ServiceConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: ServiceConfig) -> Harness {
    let db = Arc::new(RecadoDb::in_memory().await.unwrap());
    let gateway = Arc::new(FakeGateway::default());
    let worker = RecadoWorker::new(db.clone(), gateway.clone(), config);
    let instance = db
        .create_instance(&NewInstance {
            school_id: "school-1".into(),
            name: "Escola Central".into(),
            gateway_instance_id: "gw-1".into(),
            gateway_token: "token-1".into(),
            webhook_url: None,
            webhook_secret: None,
        })
        .await
        .unwrap();

    Harness {
        db,
        gateway,
        worker,
        instance,
    }
}

impl Harness {
    /// Drives the instance to `connected` through connect plus a pairing webhook.
    pub async fn connect(&self) -> Instance {
        let connections = self.worker.connections();
        connections.request_connect(&ViewerScope::Admin, &self.instance.id).await.unwrap();
        connections
            .apply_connection_update(
                &self.instance.id,
                ConnectionUpdate::Connected {
                    phone_number: Some("5511999990000".into()),
                },
            )
            .await
            .unwrap()
    }
}

pub fn inbound(instance_id: &str, external_id: &str, wa_id: &str, content: &str, ts: i64) -> GatewayEvent {
    message_event(instance_id, external_id, wa_id, content, ts, Direction::Inbound)
}

pub fn message_event(
    instance_id: &str,
    external_id: &str,
    wa_id: &str,
    content: &str,
    timestamp: i64,
    direction: Direction,
) -> GatewayEvent {
    GatewayEvent::Message(NewMessageEvent {
        instance_id: instance_id.to_string(),
        external_id: external_id.to_string(),
        contact: ContactIdentity {
            wa_id: wa_id.to_string(),
            name: Some(format!("Contato {wa_id}")),
            phone: None,
            is_group: false,
        },
        direction,
        content: Some(content.to_string()),
        media: None,
        timestamp,
        metadata: None,
    })
}
