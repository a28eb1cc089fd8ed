mod cache;
mod config;
mod connection;
mod conversations;
mod dispatcher;
mod error;
mod events;
mod ingest;
mod registry;
mod scope;
mod templates;
mod worker;

pub use cache::{LruQueryCache, QueryCache};
pub use config::{ReconnectPolicy, ServiceConfig};
pub use connection::{ConnectionManager, DisconnectOutcome};
pub use conversations::ConversationAggregator;
pub use dispatcher::{OutboundBody, OutboundDispatcher, SendRequest};
pub use error::{ErrorKind, Result, ServiceError};
pub use events::WorkerEvent;
pub use ingest::{IngestOutcome, IngestionPipeline};
pub use registry::{CreateInstance, InstanceRegistry, InstanceSummary};
pub use scope::ViewerScope;
pub use templates::{CreateTemplate, TemplateService};
pub use worker::RecadoWorker;

pub use recado_core::{GatewayEvent, InstanceStatus, MessageStatus};
pub use recado_db::{Contact, Conversation, Instance, Message, RecadoDb, Template};
pub use recado_gateway::GatewayClient;
