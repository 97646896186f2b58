use anyhow::Result;
use uuid::Uuid;

use crate::StoragePool;

/// Membership queries over conversations and their participants. Every
/// query is tenant-scoped; this repository is the authorization ground
/// truth for the gateway.
#[derive(Clone)]
pub struct ConversationRepository {
    pool: StoragePool,
}

impl ConversationRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, tenant_id: Uuid, participant_ids: &[Uuid]) -> Result<Uuid> {
        let conversation_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO conversations (tenant_id)
            VALUES ($1)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .fetch_one(self.pool.pool())
        .await?;

        for user_id in participant_ids {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (conversation_id, user_id, tenant_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(conversation_id)
            .bind(user_id)
            .bind(tenant_id)
            .execute(self.pool.pool())
            .await?;
        }

        Ok(conversation_id)
    }

    pub async fn participant_ids(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM conversation_participants
            WHERE conversation_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(tenant_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(ids)
    }

    /// Distinct users sharing at least one conversation with `user_id`
    /// within the tenant, excluding the user themselves. This is the
    /// presence-broadcast audience.
    pub async fn co_participant_ids(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT other.user_id
            FROM conversation_participants mine
            JOIN conversation_participants other
              ON other.conversation_id = mine.conversation_id
             AND other.tenant_id = mine.tenant_id
            WHERE mine.user_id = $1
              AND mine.tenant_id = $2
              AND other.user_id <> $1
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use crate::UserRepository;

    #[tokio::test]
    async fn membership_is_tenant_scoped_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("conversation membership test").await else {
            return Ok(());
        };

        let tenant_id = Uuid::new_v4();
        let users = UserRepository::new(pool.clone());
        let alice = users.create(tenant_id, "membership-alice", None).await?;
        let bob = users.create(tenant_id, "membership-bob", None).await?;

        let repo = ConversationRepository::new(pool.clone());
        let conversation = repo.create(tenant_id, &[alice.id, bob.id]).await?;

        let mut participants = repo.participant_ids(tenant_id, conversation).await?;
        participants.sort();
        let mut expected = vec![alice.id, bob.id];
        expected.sort();
        assert_eq!(participants, expected);

        // The same conversation id under a different tenant has no members.
        assert!(repo
            .participant_ids(Uuid::new_v4(), conversation)
            .await?
            .is_empty());

        let co = repo.co_participant_ids(tenant_id, alice.id).await?;
        assert_eq!(co, vec![bob.id]);

        Ok(())
    }
}
