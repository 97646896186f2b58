use anyhow::{Context, Result};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

/// Display fields this subsystem reads when enriching outbound payloads.
/// Account provisioning and credentials live in the platform's CRUD API.
#[derive(Debug, Clone, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// The name shown on broadcast frames.
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Clone)]
pub struct UserRepository {
    pool: StoragePool,
}

impl UserRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn find_profile(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, username, display_name, avatar_url
            FROM users
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying profile for user {user_id}"))?;
        Ok(profile)
    }

    /// Seed a user row. Used by the CLI seeding commands and tests; the
    /// production writer is the platform's user-management API.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            INSERT INTO users (tenant_id, username, display_name)
            VALUES ($1, $2, $3)
            RETURNING id, username, display_name, avatar_url
            "#,
        )
        .bind(tenant_id)
        .bind(username)
        .bind(display_name)
        .fetch_one(self.pool.pool())
        .await
        .with_context(|| format!("creating user '{username}'"))?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn profile_lookup_is_tenant_scoped_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("user profile test").await else {
            return Ok(());
        };

        let tenant_id = Uuid::new_v4();
        let repo = UserRepository::new(pool.clone());
        let created = repo
            .create(tenant_id, "profile-user", Some("Profile User"))
            .await?;

        let found = repo
            .find_profile(tenant_id, created.id)
            .await?
            .expect("profile visible in its tenant");
        assert_eq!(found.display(), "Profile User");

        assert!(repo
            .find_profile(Uuid::new_v4(), created.id)
            .await?
            .is_none());

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(created.id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
