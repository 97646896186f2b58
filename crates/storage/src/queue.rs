use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use anyhow::Result;
use crewline_core::QueueStatus;

use crate::StoragePool;

#[derive(Clone)]
pub struct DeliveryQueueRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeliveryQueueEntry {
    pub id: Uuid,
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryQueueEntry {
    pub fn queue_status(&self) -> QueueStatus {
        self.status.parse().unwrap_or(QueueStatus::Failed)
    }
}

const ENTRY_COLUMNS: &str =
    "id, message_id, recipient_id, status, attempts, last_attempt, created_at";

impl DeliveryQueueRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, message_id: Uuid, recipient_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_queue (message_id, recipient_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(message_id)
        .bind(recipient_id)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Oldest retriable entries, bounded by the batch size and attempt cap.
    pub async fn pending_batch(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeliveryQueueEntry>> {
        let entries = sqlx::query_as::<_, DeliveryQueueEntry>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM delivery_queue
            WHERE status = 'pending' AND attempts < $2
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(entries)
    }

    /// Claim an entry for one delivery attempt: `processing` marker, attempt
    /// counter bump, `last_attempt` stamp. Returns the new attempt count.
    pub async fn begin_attempt(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<i32> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE delivery_queue
            SET status = 'processing', attempts = attempts + 1, last_attempt = $2
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(entry_id)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(attempts)
    }

    pub async fn set_status(&self, entry_id: Uuid, status: QueueStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = $2
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(status.as_str())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    pub async fn attempts(&self, entry_id: Uuid) -> Result<i32> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT attempts
            FROM delivery_queue
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use crate::{ConversationRepository, MessageRepository, NewMessage, UserRepository};

    #[tokio::test]
    async fn attempt_bookkeeping_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("delivery queue test").await else {
            return Ok(());
        };

        let tenant_id = Uuid::new_v4();
        let users = UserRepository::new(pool.clone());
        let sender = users.create(tenant_id, "queue-sender", None).await?;
        let recipient = users.create(tenant_id, "queue-recipient", None).await?;
        let conversations = ConversationRepository::new(pool.clone());
        let conversation = conversations
            .create(tenant_id, &[sender.id, recipient.id])
            .await?;
        let messages = MessageRepository::new(pool.clone());
        let message = messages
            .insert(&NewMessage {
                conversation_id: conversation,
                sender_id: sender.id,
                tenant_id,
                content: "queued".into(),
                attachments: None,
                scheduled_delivery: None,
            })
            .await?;

        let repo = DeliveryQueueRepository::new(pool.clone());
        repo.enqueue(message.id, recipient.id).await?;

        let batch = repo.pending_batch(50, 3).await?;
        let entry = batch
            .iter()
            .find(|e| e.message_id == message.id)
            .expect("entry queued");
        assert_eq!(entry.queue_status(), QueueStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert!(entry.last_attempt.is_none());

        let attempts = repo.begin_attempt(entry.id, Utc::now()).await?;
        assert_eq!(attempts, 1);

        // A processing entry is no longer eligible for the next batch.
        assert!(!repo
            .pending_batch(50, 3)
            .await?
            .iter()
            .any(|e| e.id == entry.id));

        repo.set_status(entry.id, QueueStatus::Delivered).await?;
        assert_eq!(repo.attempts(entry.id).await?, 1);

        sqlx::query("DELETE FROM delivery_queue WHERE id = $1")
            .bind(entry.id)
            .execute(pool.pool())
            .await?;
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message.id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
