use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway timed out")]
    Timeout,

    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected gateway response: {0}")]
    Decode(String),

    #[error("Invalid webhook signature")]
    BadSignature,

    #[error("Webhook signature missing")]
    MissingSignature,
}

impl GatewayError {
    /// Timeouts, transport failures, rate limiting and 5xx answers may succeed
    /// on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
