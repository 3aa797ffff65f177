use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use super::domain::OutboxMessage;
use super::error::MessagingError;
use super::storage::MessagingStorage;

/// The pending-message queue: what was composed but not yet confirmed.
#[derive(Clone)]
pub struct MessagingService {
    storage: MessagingStorage,
}

impl MessagingService {
    pub fn new(storage: MessagingStorage) -> Self {
        Self { storage }
    }

    pub async fn create_pending_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: String,
    ) -> Result<OutboxMessage, MessagingError> {
        let outbox = OutboxMessage {
            client_id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content,
            // Fixed-width timestamps keep lexical order equal to time order.
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            attempts: 0,
            last_error: None,
        };

        self.storage.enqueue_outbox(&outbox).await?;
        tracing::debug!(
            component = "messaging.outbox",
            client_id = %outbox.client_id,
            receiver_id = %receiver_id,
            "message queued"
        );
        Ok(outbox)
    }

    /// The backend refused the message; counts toward the attempt cap.
    pub async fn mark_send_failed(&self, client_id: Uuid, error: &str) -> Result<(), MessagingError> {
        self.storage.update_outbox_error(client_id, error).await
    }

    /// The backend was unreachable; the message keeps its attempt count.
    pub async fn mark_send_interrupted(
        &self,
        client_id: Uuid,
        error: &str,
    ) -> Result<(), MessagingError> {
        self.storage.note_outbox_error(client_id, error).await
    }

    /// Drops a queued message the user gave up on.
    pub async fn discard(&self, client_id: Uuid) -> Result<(), MessagingError> {
        self.storage.remove_outbox(client_id).await?;
        tracing::info!(component = "messaging.outbox", client_id = %client_id, "queued message discarded");
        Ok(())
    }

    pub async fn mark_send_success(&self, client_id: Uuid) -> Result<(), MessagingError> {
        self.storage.remove_outbox(client_id).await
    }

    pub async fn pending_for_thread(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<OutboxMessage>, MessagingError> {
        self.storage.list_outbox_for(sender_id, receiver_id).await
    }

    pub async fn list_outbox(&self, limit: i64) -> Result<Vec<OutboxMessage>, MessagingError> {
        self.storage.list_outbox(limit).await
    }
}
