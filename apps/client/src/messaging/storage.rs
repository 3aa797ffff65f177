use std::path::PathBuf;

use sqlx::SqlitePool;
use uuid::Uuid;

use super::domain::OutboxMessage;
use super::error::MessagingError;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    client_id: String,
    sender_id: String,
    receiver_id: String,
    content: String,
    created_at: String,
    attempts: i64,
    last_error: Option<String>,
}

#[derive(Clone)]
pub struct MessagingStorage {
    pool: SqlitePool,
}

impl MessagingStorage {
    pub async fn new(pool: SqlitePool) -> Result<Self, MessagingError> {
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn open(db_path: PathBuf) -> Result<Self, MessagingError> {
        Self::new(crate::storage::open_pool(db_path).await?).await
    }

    async fn init_schema(&self) -> Result<(), MessagingError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                client_id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox(created_at ASC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn enqueue_outbox(&self, item: &OutboxMessage) -> Result<(), MessagingError> {
        sqlx::query(
            r#"
            INSERT INTO outbox (
                client_id, sender_id, receiver_id, content, created_at, attempts, last_error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_id) DO UPDATE SET
                sender_id = excluded.sender_id,
                receiver_id = excluded.receiver_id,
                content = excluded.content,
                created_at = excluded.created_at,
                attempts = excluded.attempts,
                last_error = excluded.last_error
            "#,
        )
        .bind(item.client_id.to_string())
        .bind(item.sender_id.to_string())
        .bind(item.receiver_id.to_string())
        .bind(&item.content)
        .bind(&item.created_at)
        .bind(item.attempts)
        .bind(&item.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_outbox(&self, client_id: Uuid) -> Result<(), MessagingError> {
        sqlx::query("DELETE FROM outbox WHERE client_id = ?")
            .bind(client_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_outbox_error(
        &self,
        client_id: Uuid,
        err: &str,
    ) -> Result<(), MessagingError> {
        self.set_outbox_error(client_id, err, 1).await
    }

    /// Keeps the error of an attempt that never reached the backend without
    /// counting it.
    pub async fn note_outbox_error(
        &self,
        client_id: Uuid,
        err: &str,
    ) -> Result<(), MessagingError> {
        self.set_outbox_error(client_id, err, 0).await
    }

    async fn set_outbox_error(
        &self,
        client_id: Uuid,
        err: &str,
        counted: i64,
    ) -> Result<(), MessagingError> {
        let updated = sqlx::query(
            "UPDATE outbox SET attempts = attempts + ?, last_error = ? WHERE client_id = ?",
        )
        .bind(counted)
        .bind(err)
        .bind(client_id.to_string())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MessagingError::UnknownMessage(client_id));
        }
        Ok(())
    }

    pub async fn list_outbox(&self, limit: i64) -> Result<Vec<OutboxMessage>, MessagingError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT client_id, sender_id, receiver_id, content, created_at, attempts, last_error
            FROM outbox
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    /// Queued messages from `sender_id` to `receiver_id`, oldest first.
    pub async fn list_outbox_for(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<OutboxMessage>, MessagingError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT client_id, sender_id, receiver_id, content, created_at, attempts, last_error
            FROM outbox
            WHERE sender_id = ? AND receiver_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(sender_id.to_string())
        .bind(receiver_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    fn row_to_outbox(row: OutboxRow) -> Result<OutboxMessage, MessagingError> {
        let parse = |raw: &str| {
            Uuid::parse_str(raw).map_err(|e| MessagingError::Corrupt(format!("{}: {}", raw, e)))
        };

        Ok(OutboxMessage {
            client_id: parse(&row.client_id)?,
            sender_id: parse(&row.sender_id)?,
            receiver_id: parse(&row.receiver_id)?,
            content: row.content,
            created_at: row.created_at,
            attempts: row.attempts,
            last_error: row.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.sqlite", prefix, Uuid::new_v4()))
    }

    fn queued(sender: Uuid, receiver: Uuid, content: &str, created_at: &str) -> OutboxMessage {
        OutboxMessage {
            client_id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            content: content.to_string(),
            created_at: created_at.to_string(),
            attempts: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn outbox_error_and_remove_work() {
        let db_path = temp_db_path("messaging-storage-outbox");
        let storage = MessagingStorage::open(db_path.clone())
            .await
            .expect("storage init");

        let item = queued(Uuid::new_v4(), Uuid::new_v4(), "hello", "2026-10-19T00:01:00Z");
        storage.enqueue_outbox(&item).await.expect("enqueue outbox");
        storage
            .update_outbox_error(item.client_id, "timeout")
            .await
            .expect("update outbox error");

        let listed = storage.list_outbox(10).await.expect("list outbox");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("timeout"));

        storage
            .note_outbox_error(item.client_id, "offline")
            .await
            .expect("note outbox error");
        let listed = storage.list_outbox(10).await.expect("list outbox");
        assert_eq!(listed[0].attempts, 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("offline"));

        storage
            .remove_outbox(item.client_id)
            .await
            .expect("remove outbox");
        let listed = storage
            .list_outbox(10)
            .await
            .expect("list outbox after remove");
        assert!(listed.is_empty());

        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn list_for_thread_filters_and_orders() {
        let db_path = temp_db_path("messaging-storage-thread");
        let storage = MessagingStorage::open(db_path.clone())
            .await
            .expect("storage init");

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let second = queued(a, b, "second", "2026-10-19T00:00:02Z");
        let first = queued(a, b, "first", "2026-10-19T00:00:01Z");
        let other = queued(a, c, "elsewhere", "2026-10-19T00:00:00Z");

        for item in [&second, &first, &other] {
            storage.enqueue_outbox(item).await.expect("enqueue");
        }

        let thread = storage.list_outbox_for(a, b).await.expect("list thread");
        let contents = thread.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["first", "second"]);

        let reverse = storage.list_outbox_for(b, a).await.expect("list reverse");
        assert!(reverse.is_empty());

        let _ = std::fs::remove_file(db_path);
    }
}
