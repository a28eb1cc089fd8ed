mod client;
mod error;
mod http;
mod signature;

pub use client::{
    GatewayClient, InstanceCredentials, SentMessage, SessionStart, SessionState, SessionStatus,
};
pub use error::{GatewayError, Result};
pub use http::{HttpGateway, HttpGatewayConfig};
pub use signature::{SIGNATURE_HEADER, sign, verify_signature};
