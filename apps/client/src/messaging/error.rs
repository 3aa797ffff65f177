use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("outbox database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("outbox row {0} is not queued")]
    UnknownMessage(Uuid),

    #[error("corrupt outbox row: {0}")]
    Corrupt(String),
}
