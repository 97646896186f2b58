use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use anyhow::Result;
use crewline_core::DeliveryStatus;

use crate::StoragePool;

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

/// A persisted chat message. `delivery_status` is kept as raw text the way
/// the column stores it; use [`MessageRecord::status`] for the typed view.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub tenant_id: Uuid,
    pub content: String,
    pub attachments: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: String,
    pub scheduled_delivery: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn status(&self) -> DeliveryStatus {
        self.delivery_status
            .parse()
            .unwrap_or(DeliveryStatus::Failed)
    }
}

/// Insert payload for a new message row. A `scheduled_delivery` in the
/// future parks the row in `scheduled` state for the scheduler to promote.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub tenant_id: Uuid,
    pub content: String,
    pub attachments: Option<serde_json::Value>,
    pub scheduled_delivery: Option<DateTime<Utc>>,
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, tenant_id, content, attachments, \
     created_at, delivery_status, scheduled_delivery, is_read, read_at";

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: &NewMessage) -> Result<MessageRecord> {
        let status = if new.scheduled_delivery.is_some() {
            DeliveryStatus::Scheduled
        } else {
            DeliveryStatus::Sent
        };
        let message = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages
                (conversation_id, sender_id, tenant_id, content, attachments,
                 delivery_status, scheduled_delivery)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {MESSAGE_COLUMNS}
            "#,
        ))
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(new.tenant_id)
        .bind(&new.content)
        .bind(new.attachments.clone())
        .bind(status.as_str())
        .bind(new.scheduled_delivery)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(message)
    }

    pub async fn find(&self, tenant_id: Uuid, message_id: Uuid) -> Result<Option<MessageRecord>> {
        let message = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE id = $1 AND tenant_id = $2
            "#,
        ))
        .bind(message_id)
        .bind(tenant_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(message)
    }

    /// Lookup for the delivery loop, which is tenant-agnostic at the query
    /// level; the entry is tenant-scoped through the message row itself.
    pub async fn find_for_delivery(&self, message_id: Uuid) -> Result<Option<MessageRecord>> {
        let message = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE id = $1
            "#,
        ))
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(message)
    }

    pub async fn mark_read(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>> {
        let message = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET is_read = TRUE, read_at = $3
            WHERE id = $1 AND tenant_id = $2
            RETURNING {MESSAGE_COLUMNS}
            "#,
        ))
        .bind(message_id)
        .bind(tenant_id)
        .bind(read_at)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(message)
    }

    pub async fn set_delivery_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET delivery_status = $2
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(status.as_str())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Messages whose scheduled delivery time has elapsed and which are
    /// still waiting in `scheduled` state.
    pub async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let messages = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE delivery_status = 'scheduled' AND scheduled_delivery <= $1
            ORDER BY scheduled_delivery ASC
            LIMIT $2
            "#,
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(messages)
    }

    /// Flip a due message to `delivered` and clear its schedule. The status
    /// guard in the WHERE clause is what makes re-selection idempotent.
    pub async fn promote_scheduled(&self, message_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET delivery_status = 'delivered', scheduled_delivery = NULL
            WHERE id = $1 AND delivery_status = 'scheduled'
            "#,
        )
        .bind(message_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use crate::{ConversationRepository, UserRepository};

    #[tokio::test]
    async fn message_lifecycle_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("message lifecycle test").await else {
            return Ok(());
        };

        let tenant_id = Uuid::new_v4();
        let users = UserRepository::new(pool.clone());
        let sender = users
            .create(tenant_id, "lifecycle-sender", Some("Lifecycle Sender"))
            .await?;
        let conversations = ConversationRepository::new(pool.clone());
        let conversation = conversations.create(tenant_id, &[sender.id]).await?;

        let repo = MessageRepository::new(pool.clone());
        let stored = repo
            .insert(&NewMessage {
                conversation_id: conversation,
                sender_id: sender.id,
                tenant_id,
                content: "hello crew".into(),
                attachments: None,
                scheduled_delivery: None,
            })
            .await?;
        assert_eq!(stored.status(), DeliveryStatus::Sent);
        assert!(!stored.is_read);

        // Tenant scoping: the row is invisible to another tenant.
        assert!(repo.find(Uuid::new_v4(), stored.id).await?.is_none());
        assert!(repo.find(tenant_id, stored.id).await?.is_some());

        let read = repo
            .mark_read(tenant_id, stored.id, Utc::now())
            .await?
            .expect("row updates");
        assert!(read.is_read);
        assert!(read.read_at.is_some());

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(stored.id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn scheduled_promotion_is_guarded_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("scheduled promotion test").await else {
            return Ok(());
        };

        let tenant_id = Uuid::new_v4();
        let users = UserRepository::new(pool.clone());
        let sender = users.create(tenant_id, "promotion-sender", None).await?;
        let conversations = ConversationRepository::new(pool.clone());
        let conversation = conversations.create(tenant_id, &[sender.id]).await?;

        let repo = MessageRepository::new(pool.clone());
        let stored = repo
            .insert(&NewMessage {
                conversation_id: conversation,
                sender_id: sender.id,
                tenant_id,
                content: "later".into(),
                attachments: None,
                scheduled_delivery: Some(Utc::now() - chrono::Duration::minutes(1)),
            })
            .await?;
        assert_eq!(stored.status(), DeliveryStatus::Scheduled);

        let due = repo.due_scheduled(Utc::now(), 50).await?;
        assert!(due.iter().any(|m| m.id == stored.id));

        assert!(repo.promote_scheduled(stored.id).await?);
        // Second promotion finds no row in `scheduled` state.
        assert!(!repo.promote_scheduled(stored.id).await?);

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(stored.id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
