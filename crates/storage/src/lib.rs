//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub mod conversation;
pub mod message;
pub mod queue;
pub mod user;

pub use sqlx::PgPool;

pub use conversation::ConversationRepository;
pub use message::{MessageRecord, MessageRepository, NewMessage};
pub use queue::{DeliveryQueueEntry, DeliveryQueueRepository};
pub use user::{UserProfile, UserRepository};

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Clone the shared pool handle.
    pub fn cloned(&self) -> Arc<PgPool> {
        self.pool.clone()
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

pub fn validate_database_url(database_url: &str) -> Result<()> {
    PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy(database_url)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::env;

    /// Connect to the test database if one is configured, otherwise `None`
    /// so the caller can skip.
    pub async fn test_pool(test_name: &str) -> Option<StoragePool> {
        let database_url =
            match env::var("CREWLINE_TEST_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
                Ok(url) => url,
                Err(_) => {
                    eprintln!(
                        "skipping {test_name}: set CREWLINE_TEST_DATABASE_URL or DATABASE_URL"
                    );
                    return None;
                }
            };
        Some(connect(&database_url).await.expect("test database connects"))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use sqlx::migrate::Migrator;

    static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

    #[test]
    fn discovers_migrations() {
        assert!(
            !MIGRATOR.migrations.is_empty(),
            "expected at least one migration"
        );
    }

    #[tokio::test]
    async fn migrations_apply_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = super::test_support::test_pool("migration smoke test").await else {
            return Ok(());
        };

        MIGRATOR
            .run(pool.pool())
            .await
            .with_context(|| "running SQLx migrations failed")?;
        Ok(())
    }
}
