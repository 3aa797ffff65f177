use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued locally, not yet confirmed by the backend.
    Pending,
    Sent,
    /// Last attempt was rejected; still queued.
    Failed,
}

impl DeliveryStatus {
    pub fn is_pending(self) -> bool {
        !matches!(self, DeliveryStatus::Sent)
    }
}

/// A message waiting in the local queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub client_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn status(&self) -> DeliveryStatus {
        if self.last_error.is_some() {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Pending
        }
    }

    /// Rejected often enough that it is no longer sent on its own.
    pub fn exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= i64::from(max_attempts)
    }
}
