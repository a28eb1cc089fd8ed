use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recado_core::{ConnectionUpdate, InstanceStatus};
use recado_db::{Instance, InstanceConfigUpdate, RecadoDb};
use recado_gateway::{GatewayClient, GatewayError, InstanceCredentials, SessionState};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::{ReconnectPolicy, ServiceConfig};
use crate::error::{Result, ServiceError};
use crate::events::WorkerEvent;
use crate::scope::ViewerScope;

/// Runs a gateway call under `limit`, reporting an overrun as a timeout.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = recado_gateway::Result<T>>,
) -> recado_gateway::Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

pub(crate) fn credentials(instance: &Instance) -> InstanceCredentials {
    InstanceCredentials {
        instance_id: instance.gateway_instance_id.clone(),
        token: instance.gateway_token.clone(),
    }
}

/// One async lock per instance id. Transitions of the same instance queue up,
/// different instances never wait on each other.
#[derive(Default)]
struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectOutcome {
    pub instance: Instance,
    /// Set when the gateway could not confirm the session was ended.
    pub gateway_error: Option<String>,
}

/// Owns the connection lifecycle of every instance. It is the only component
/// that writes instance status.
pub struct ConnectionManager {
    db: Arc<RecadoDb>,
    gateway: Arc<dyn GatewayClient>,
    config: Arc<ServiceConfig>,
    events: broadcast::Sender<WorkerEvent>,
    locks: InstanceLocks,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        db: Arc<RecadoDb>,
        gateway: Arc<dyn GatewayClient>,
        config: Arc<ServiceConfig>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            db,
            gateway,
            config,
            events,
            locks: InstanceLocks::default(),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts pairing and returns the instance carrying a scannable QR.
    ///
    /// Repeated calls while a QR is still fresh return that same QR.
    #[instrument(skip(self))]
    pub async fn request_connect(
        self: &Arc<Self>,
        viewer: &ViewerScope,
        instance_id: &str,
    ) -> Result<Instance> {
        self.authorize(viewer, instance_id).await?;
        let instance = {
            let _guard = self.locks.acquire(instance_id).await;
            let instance = self.active_instance(instance_id).await?;
            let now = Utc::now().timestamp();

            match instance.status {
                InstanceStatus::Connected => {
                    return Err(ServiceError::Conflict(format!(
                        "instance {instance_id} is already connected"
                    )));
                }
                InstanceStatus::Connecting if instance.fresh_qr(now).is_some() => {
                    debug!("QR still valid, reusing it");
                    instance
                }
                InstanceStatus::Error
                    if self.config.reconnect_policy == ReconnectPolicy::RequireFreshCredentials =>
                {
                    return Err(ServiceError::Conflict(format!(
                        "instance {instance_id} failed; update its credentials before reconnecting"
                    )));
                }
                _ => self.issue_qr(&instance, 1).await?,
            }
        };

        self.watch(instance_id).await;
        Ok(instance)
    }

    /// Asks the gateway for the session state and applies the result.
    ///
    /// Expired QRs are re-issued here until `max_qr_attempts` is exhausted.
    pub async fn poll_status(&self, viewer: &ViewerScope, instance_id: &str) -> Result<Instance> {
        self.authorize(viewer, instance_id).await?;
        self.poll_once(instance_id).await
    }

    async fn poll_once(&self, instance_id: &str) -> Result<Instance> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.db.get_instance(instance_id).await?;
        if !instance.is_active || !instance.status.holds_session() {
            return Ok(instance);
        }

        let status = match bounded(
            self.config.gateway_timeout,
            self.gateway.get_status(&credentials(&instance)),
        )
        .await
        {
            Ok(status) => status,
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                self.fail(&instance, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        match (instance.status, status.state) {
            (InstanceStatus::Connecting, SessionState::Connected) => {
                let connected = self
                    .db
                    .mark_connected(instance_id, status.phone_number.as_deref())
                    .await?;
                info!(instance_id, phone = ?connected.phone_number, "Instance connected");
                self.emit_status(&connected);
                Ok(connected)
            }
            (_, SessionState::Failed(reason)) => self.fail(&instance, &reason).await,
            (InstanceStatus::Connected, SessionState::Pairing | SessionState::Disconnected) => {
                let lost = self.db.mark_disconnected(instance_id).await?;
                warn!(instance_id, "Gateway session lost");
                self.emit_status(&lost);
                Ok(lost)
            }
            (InstanceStatus::Connecting, _) => self.refresh_expired_qr(&instance).await,
            _ => Ok(instance),
        }
    }

    /// Applies a connection change pushed by the gateway webhook.
    #[instrument(skip(self))]
    pub async fn apply_connection_update(
        &self,
        instance_id: &str,
        update: ConnectionUpdate,
    ) -> Result<Instance> {
        let updated = {
            let _guard = self.locks.acquire(instance_id).await;
            let instance = self.db.get_instance(instance_id).await?;

            match update {
                ConnectionUpdate::Connected { phone_number }
                    if instance.status == InstanceStatus::Connecting =>
                {
                    let connected = self
                        .db
                        .mark_connected(instance_id, phone_number.as_deref())
                        .await?;
                    info!(phone = ?connected.phone_number, "Instance connected");
                    self.emit_status(&connected);
                    connected
                }
                ConnectionUpdate::Disconnected { reason } if instance.status.holds_session() => {
                    let lost = self.db.mark_disconnected(instance_id).await?;
                    warn!(reason = ?reason, "Gateway reported session lost");
                    self.emit_status(&lost);
                    lost
                }
                ConnectionUpdate::Qr {
                    payload,
                    expires_at,
                } if instance.status == InstanceStatus::Connecting => {
                    let now = Utc::now().timestamp();
                    let expires_at = expires_at
                        .unwrap_or_else(|| now.saturating_add(ttl_secs(self.config.qr_ttl)));
                    let attempt = instance.qr_attempts.max(1);
                    let refreshed = self
                        .db
                        .mark_connecting(instance_id, &payload, now, expires_at, attempt)
                        .await?;
                    self.emit(WorkerEvent::QrIssued {
                        instance_id: instance_id.to_string(),
                        expires_at,
                        attempt,
                    });
                    refreshed
                }
                update => {
                    debug!(status = %instance.status, ?update, "Connection update does not apply");
                    instance
                }
            }
        };

        if updated.status != InstanceStatus::Connecting {
            self.stop_polling(instance_id).await;
        }
        Ok(updated)
    }

    /// Ends the session. The instance ends up `disconnected` even when the
    /// gateway call fails; the failure is reported in the outcome.
    #[instrument(skip(self))]
    pub async fn request_disconnect(
        &self,
        viewer: &ViewerScope,
        instance_id: &str,
    ) -> Result<DisconnectOutcome> {
        self.authorize(viewer, instance_id).await?;
        let outcome = {
            let _guard = self.locks.acquire(instance_id).await;
            let instance = self.db.get_instance(instance_id).await?;
            if !instance.status.holds_session() {
                return Err(ServiceError::Conflict(format!(
                    "instance {instance_id} has no session to end (status {})",
                    instance.status
                )));
            }

            let gateway_error = self.end_session(&instance).await;
            let instance = self.db.mark_disconnected(instance_id).await?;
            info!(gateway_error = ?gateway_error, "Instance disconnected");
            self.emit_status(&instance);
            DisconnectOutcome {
                instance,
                gateway_error,
            }
        };

        self.stop_polling(instance_id).await;
        Ok(outcome)
    }

    /// Soft-deletes the instance, ending its session on the way out.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, viewer: &ViewerScope, instance_id: &str) -> Result<Instance> {
        self.authorize(viewer, instance_id).await?;
        let instance = {
            let _guard = self.locks.acquire(instance_id).await;
            let instance = self.db.get_instance(instance_id).await?;
            if instance.status.holds_session() {
                self.end_session(&instance).await;
            }
            let instance = self.db.deactivate_instance(instance_id).await?;
            info!("Instance deactivated");
            self.emit_status(&instance);
            instance
        };

        self.stop_polling(instance_id).await;
        Ok(instance)
    }

    /// Writes new credentials or webhook settings.
    ///
    /// Credentials cannot change under a live session. New credentials clear
    /// an `error` state back to `disconnected`.
    #[instrument(skip(self, update))]
    pub async fn update_config(
        &self,
        viewer: &ViewerScope,
        instance_id: &str,
        update: &InstanceConfigUpdate,
    ) -> Result<Instance> {
        self.authorize(viewer, instance_id).await?;
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.active_instance(instance_id).await?;
        if update.touches_credentials() && instance.status.holds_session() {
            return Err(ServiceError::Conflict(format!(
                "disconnect instance {instance_id} before changing its credentials"
            )));
        }

        let updated = self.db.update_instance_config(instance_id, update).await?;
        if update.touches_credentials() && updated.status == InstanceStatus::Error {
            let reset = self.db.mark_disconnected(instance_id).await?;
            info!("Credentials replaced, error cleared");
            self.emit_status(&reset);
            return Ok(reset);
        }
        Ok(updated)
    }

    /// Keeps polling the instance until it leaves `connecting`.
    /// Replaces any loop already running for it.
    pub async fn watch(self: &Arc<Self>, instance_id: &str) {
        let manager = Arc::clone(self);
        let id = instance_id.to_string();
        let handle = tokio::spawn(async move { manager.poll_loop(id).await });

        if let Some(previous) = self.pollers.lock().await.insert(instance_id.to_string(), handle) {
            previous.abort();
        }
    }

    pub async fn stop_polling(&self, instance_id: &str) {
        if let Some(handle) = self.pollers.lock().await.remove(instance_id) {
            debug!(instance_id, "Stopping status poller");
            handle.abort();
        }
    }

    /// Restarts polling for instances left mid-pairing by a previous run.
    pub async fn resume(self: &Arc<Self>) -> Result<usize> {
        let pairing: Vec<Instance> = self
            .db
            .list_instances(true)
            .await?
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Connecting)
            .collect();

        for instance in &pairing {
            self.watch(&instance.id).await;
        }
        Ok(pairing.len())
    }

    pub async fn shutdown(&self) {
        for (_, handle) in self.pollers.lock().await.drain() {
            handle.abort();
        }
    }

    pub async fn is_polling(&self, instance_id: &str) -> bool {
        self.pollers
            .lock()
            .await
            .get(instance_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn poll_loop(self: Arc<Self>, instance_id: String) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.poll_once(&instance_id).await {
                Ok(instance) if instance.status.is_terminal() || !instance.is_active => {
                    debug!(instance_id, status = %instance.status, "Polling finished");
                    break;
                }
                Ok(_) => {}
                Err(ServiceError::NotFound(_)) => break,
                Err(e) => warn!(instance_id, error = %e, "Status poll failed"),
            }
        }
    }

    /// Instances of other schools look exactly like missing ones. A school
    /// never changes, so the check holds once the lock is taken.
    async fn authorize(&self, viewer: &ViewerScope, instance_id: &str) -> Result<()> {
        if let ViewerScope::School(_) = viewer {
            let instance = self.db.get_instance(instance_id).await?;
            if !viewer.can_view(&instance) {
                return Err(ServiceError::NotFound(format!("instance {instance_id}")));
            }
        }
        Ok(())
    }

    async fn active_instance(&self, instance_id: &str) -> Result<Instance> {
        let instance = self.db.get_instance(instance_id).await?;
        if !instance.is_active {
            return Err(ServiceError::NotFound(format!(
                "instance {instance_id} is deactivated"
            )));
        }
        Ok(instance)
    }

    async fn issue_qr(&self, instance: &Instance, attempt: i64) -> Result<Instance> {
        let session = match bounded(
            self.config.gateway_timeout,
            self.gateway.start_session(&credentials(instance)),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.fail(instance, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let now = Utc::now().timestamp();
        let updated = self
            .db
            .mark_connecting(&instance.id, &session.qr_payload, now, session.expires_at, attempt)
            .await?;
        info!(instance_id = %instance.id, attempt, expires_at = session.expires_at, "QR issued");

        if instance.status != InstanceStatus::Connecting {
            self.emit_status(&updated);
        }
        self.emit(WorkerEvent::QrIssued {
            instance_id: instance.id.clone(),
            expires_at: session.expires_at,
            attempt,
        });
        Ok(updated)
    }

    async fn refresh_expired_qr(&self, instance: &Instance) -> Result<Instance> {
        let now = Utc::now().timestamp();
        if instance.fresh_qr(now).is_some() {
            return Ok(instance.clone());
        }

        let max_attempts = i64::from(self.config.max_qr_attempts);
        if instance.qr_attempts >= max_attempts {
            let reason = format!("QR code expired {max_attempts} times without being scanned");
            return self.fail(instance, &reason).await;
        }
        self.issue_qr(instance, instance.qr_attempts + 1).await
    }

    async fn fail(&self, instance: &Instance, reason: &str) -> Result<Instance> {
        let failed = self.db.mark_error(&instance.id, reason).await?;
        warn!(instance_id = %instance.id, reason, "Instance moved to error");
        self.emit_status(&failed);
        Ok(failed)
    }

    /// Best effort; returns the gateway failure, if any.
    async fn end_session(&self, instance: &Instance) -> Option<String> {
        bounded(
            self.config.gateway_timeout,
            self.gateway.end_session(&credentials(instance)),
        )
        .await
        .err()
        .map(|e| {
            warn!(instance_id = %instance.id, error = %e, "Gateway did not confirm session end");
            e.to_string()
        })
    }

    fn emit_status(&self, instance: &Instance) {
        self.emit(WorkerEvent::InstanceStatusChanged {
            instance_id: instance.id.clone(),
            status: instance.status,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}
