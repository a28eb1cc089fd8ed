use std::sync::Arc;

use recado_core::GatewayEvent;
use recado_db::{Instance, RecadoDb};
use recado_gateway::{GatewayClient, verify_signature};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{ConversationCache, LruQueryCache, QueryCache};
use crate::config::ServiceConfig;
use crate::connection::ConnectionManager;
use crate::conversations::ConversationAggregator;
use crate::dispatcher::OutboundDispatcher;
use crate::error::{Result, ServiceError};
use crate::events::WorkerEvent;
use crate::ingest::{IngestOutcome, IngestionPipeline};
use crate::registry::InstanceRegistry;
use crate::templates::TemplateService;

/// Wires every component around one store and one gateway client.
pub struct RecadoWorker {
    registry: InstanceRegistry,
    connections: Arc<ConnectionManager>,
    ingest: IngestionPipeline,
    conversations: ConversationAggregator,
    dispatcher: OutboundDispatcher,
    templates: TemplateService,
    events: broadcast::Sender<WorkerEvent>,
}

impl RecadoWorker {
    pub fn new(db: Arc<RecadoDb>, gateway: Arc<dyn GatewayClient>, config: ServiceConfig) -> Self {
        let cache = Arc::new(LruQueryCache::new(config.cache_capacity));
        Self::with_cache(db, gateway, cache, config)
    }

    pub fn with_cache(
        db: Arc<RecadoDb>,
        gateway: Arc<dyn GatewayClient>,
        cache: Arc<dyn QueryCache>,
        config: ServiceConfig,
    ) -> Self {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(1000);
        let templates = TemplateService::new(db.clone());
        let cache = Arc::new(ConversationCache::new(cache, config.cache_ttl));

        Self {
            registry: InstanceRegistry::new(db.clone(), config.clone()),
            connections: Arc::new(ConnectionManager::new(
                db.clone(),
                gateway.clone(),
                config.clone(),
                events.clone(),
            )),
            ingest: IngestionPipeline::new(db.clone(), cache.clone(), events.clone()),
            conversations: ConversationAggregator::new(db.clone(), cache.clone(), config.clone()),
            dispatcher: OutboundDispatcher::new(
                db,
                gateway,
                templates.clone(),
                cache,
                config,
                events.clone(),
            ),
            templates,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn ingest(&self) -> &IngestionPipeline {
        &self.ingest
    }

    pub fn conversations(&self) -> &ConversationAggregator {
        &self.conversations
    }

    pub fn dispatcher(&self) -> &OutboundDispatcher {
        &self.dispatcher
    }

    pub fn templates(&self) -> &TemplateService {
        &self.templates
    }

    /// Resumes polling for instances a previous run left pairing.
    pub async fn start(&self) -> Result<()> {
        let resumed = self.connections.resume().await?;
        info!(resumed, "Worker started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.connections.shutdown().await;
        info!("Worker stopped");
    }

    /// Verifies, parses and applies one webhook delivery for `instance_id`.
    ///
    /// The signature is checked against the raw body before anything in it
    /// is trusted. Without a configured secret, unsigned bodies are accepted.
    pub async fn handle_webhook(
        &self,
        instance_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome> {
        let instance = self.registry.get(instance_id).await?;
        if let Some(secret) = self.registry.webhook_secret(&instance) {
            verify_signature(secret, body, signature)
                .map_err(|e| ServiceError::Unauthorized(e.to_string()))?;
        }

        let event = GatewayEvent::from_slice(body)
            .map_err(|e| ServiceError::validation(e.to_string()))?;
        self.handle_event(&instance, event).await
    }

    pub async fn handle_event(&self, instance: &Instance, event: GatewayEvent) -> Result<IngestOutcome> {
        let addressed_to = event.instance_id();
        if addressed_to != instance.id && addressed_to != instance.gateway_instance_id {
            return Err(ServiceError::validation(format!(
                "event for instance {addressed_to} delivered to {}",
                instance.id
            )));
        }
        if !instance.is_active {
            return Err(ServiceError::NotFound(format!(
                "instance {} is deactivated",
                instance.id
            )));
        }
        debug!(instance_id = %instance.id, kind = event.kind(), "Gateway event received");

        match event {
            GatewayEvent::Message(message) => self.ingest.ingest_message(instance, message).await,
            GatewayEvent::Status(status) => self.ingest.ingest_status(instance, status).await,
            GatewayEvent::Connection(connection) => self
                .connections
                .apply_connection_update(&instance.id, connection.update)
                .await
                .map(IngestOutcome::Connection),
        }
    }
}
