use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not resolve a data directory for the database")]
    NoDataDir,

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(i64),

    #[error("Message not found: {0}")]
    MessageNotFound(i64),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound(_)
                | Self::ContactNotFound(_)
                | Self::MessageNotFound(_)
                | Self::TemplateNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Maps a unique-constraint violation to [`DbError::Conflict`].
pub(crate) fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Conflict(what()),
        _ => DbError::Sqlx(err),
    }
}
