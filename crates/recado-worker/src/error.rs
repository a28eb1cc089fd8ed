use recado_core::TemplateError;
use recado_db::DbError;
use recado_gateway::GatewayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Instance {0} is not connected")]
    NotConnected(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Gateway error: {0}")]
    ExternalService(#[from] GatewayError),

    #[error("Database error: {0}")]
    Db(DbError),
}

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Unauthorized,
    ExternalService,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::ExternalService => "external_service",
            Self::Internal => "internal",
        }
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Template(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::NotConnected(_) => ErrorKind::Conflict,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::ExternalService(_) => ErrorKind::ExternalService,
            Self::Db(_) => ErrorKind::Internal,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        match err {
            e if e.is_not_found() => Self::NotFound(e.to_string()),
            DbError::Conflict(reason) => Self::Conflict(reason),
            e => Self::Db(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
