//! Conversation authorization, message persistence and fan-out, and the
//! presence broadcaster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crewline_core::{
    ClientCommand, DeliveryStatus, MessageBroadcast, PresenceStatus, QueueStatus, SendMessage,
    ServerFrame,
};
use crewline_storage::{
    ConversationRepository, DeliveryQueueEntry, DeliveryQueueRepository, MessageRecord,
    MessageRepository, NewMessage, StoragePool, UserProfile, UserRepository,
};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::registry::{Connection, ConnectionRegistry};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message not found")]
    MessageNotFound,
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Everything the chat transport needs from durable storage. The Postgres
/// implementation backs production; the in-memory one backs tests and
/// database-less development runs.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn participants(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Uuid>, ChatError>;
    async fn co_participants(&self, tenant_id: Uuid, user_id: Uuid)
        -> Result<Vec<Uuid>, ChatError>;
    async fn profile(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, ChatError>;
    async fn insert_message(&self, new: NewMessage) -> Result<MessageRecord, ChatError>;
    async fn message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError>;
    /// Tenant-agnostic lookup for the delivery loop; the entry is scoped
    /// through the message row it references.
    async fn message_for_delivery(
        &self,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError>;
    async fn mark_read(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, ChatError>;
    async fn set_message_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), ChatError>;
    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, ChatError>;
    async fn promote_scheduled(&self, message_id: Uuid) -> Result<bool, ChatError>;
    async fn enqueue_delivery(&self, message_id: Uuid, recipient_id: Uuid)
        -> Result<(), ChatError>;
    async fn pending_deliveries(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeliveryQueueEntry>, ChatError>;
    async fn begin_delivery_attempt(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, ChatError>;
    async fn set_delivery_entry_status(
        &self,
        entry_id: Uuid,
        status: QueueStatus,
    ) -> Result<(), ChatError>;
}

/// Postgres-backed store built from the storage-crate repositories.
pub struct PgChatStore {
    messages: MessageRepository,
    conversations: ConversationRepository,
    queue: DeliveryQueueRepository,
    users: UserRepository,
}

impl PgChatStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            messages: MessageRepository::new(pool.clone()),
            conversations: ConversationRepository::new(pool.clone()),
            queue: DeliveryQueueRepository::new(pool.clone()),
            users: UserRepository::new(pool),
        }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn participants(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Uuid>, ChatError> {
        Ok(self
            .conversations
            .participant_ids(tenant_id, conversation_id)
            .await?)
    }

    async fn co_participants(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Uuid>, ChatError> {
        Ok(self
            .conversations
            .co_participant_ids(tenant_id, user_id)
            .await?)
    }

    async fn profile(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, ChatError> {
        Ok(self.users.find_profile(tenant_id, user_id).await?)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<MessageRecord, ChatError> {
        Ok(self.messages.insert(&new).await?)
    }

    async fn message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError> {
        Ok(self.messages.find(tenant_id, message_id).await?)
    }

    async fn message_for_delivery(
        &self,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError> {
        Ok(self.messages.find_for_delivery(message_id).await?)
    }

    async fn mark_read(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, ChatError> {
        Ok(self.messages.mark_read(tenant_id, message_id, read_at).await?)
    }

    async fn set_message_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), ChatError> {
        Ok(self.messages.set_delivery_status(message_id, status).await?)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        Ok(self.messages.due_scheduled(now, limit).await?)
    }

    async fn promote_scheduled(&self, message_id: Uuid) -> Result<bool, ChatError> {
        Ok(self.messages.promote_scheduled(message_id).await?)
    }

    async fn enqueue_delivery(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<(), ChatError> {
        Ok(self.queue.enqueue(message_id, recipient_id).await?)
    }

    async fn pending_deliveries(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeliveryQueueEntry>, ChatError> {
        Ok(self.queue.pending_batch(limit, max_attempts).await?)
    }

    async fn begin_delivery_attempt(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, ChatError> {
        Ok(self.queue.begin_attempt(entry_id, now).await?)
    }

    async fn set_delivery_entry_status(
        &self,
        entry_id: Uuid,
        status: QueueStatus,
    ) -> Result<(), ChatError> {
        Ok(self.queue.set_status(entry_id, status).await?)
    }
}

struct ConversationEntry {
    tenant_id: Uuid,
    participants: Vec<Uuid>,
}

/// In-memory store used when no database is configured and by the test
/// suites. Mirrors the Postgres semantics, including the status guards.
#[derive(Default)]
pub struct InMemoryChatStore {
    profiles: RwLock<HashMap<Uuid, (Uuid, UserProfile)>>,
    conversations: RwLock<HashMap<Uuid, ConversationEntry>>,
    messages: RwLock<HashMap<Uuid, MessageRecord>>,
    queue: RwLock<HashMap<Uuid, DeliveryQueueEntry>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_profile(
        &self,
        tenant_id: Uuid,
        username: impl Into<String>,
        display_name: Option<&str>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let profile = UserProfile {
            id,
            username: username.into(),
            display_name: display_name.map(str::to_owned),
            avatar_url: None,
        };
        self.profiles
            .write()
            .await
            .insert(id, (tenant_id, profile));
        id
    }

    pub async fn add_conversation(&self, tenant_id: Uuid, participants: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        self.conversations.write().await.insert(
            id,
            ConversationEntry {
                tenant_id,
                participants: participants.to_vec(),
            },
        );
        id
    }

    #[cfg(test)]
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    #[cfg(test)]
    pub async fn queue_entries(&self) -> Vec<DeliveryQueueEntry> {
        let mut entries: Vec<_> = self.queue.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn participants(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Uuid>, ChatError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(&conversation_id)
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.participants.clone())
            .unwrap_or_default())
    }

    async fn co_participants(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Uuid>, ChatError> {
        let conversations = self.conversations.read().await;
        let mut others: Vec<Uuid> = conversations
            .values()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter(|entry| entry.participants.contains(&user_id))
            .flat_map(|entry| entry.participants.iter().copied())
            .filter(|other| *other != user_id)
            .collect();
        others.sort();
        others.dedup();
        Ok(others)
    }

    async fn profile(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserProfile>, ChatError> {
        let profiles = self.profiles.read().await;
        Ok(profiles
            .get(&user_id)
            .filter(|(tenant, _)| *tenant == tenant_id)
            .map(|(_, profile)| profile.clone()))
    }

    async fn insert_message(&self, new: NewMessage) -> Result<MessageRecord, ChatError> {
        let status = if new.scheduled_delivery.is_some() {
            DeliveryStatus::Scheduled
        } else {
            DeliveryStatus::Sent
        };
        let record = MessageRecord {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            tenant_id: new.tenant_id,
            content: new.content,
            attachments: new.attachments,
            created_at: Utc::now(),
            delivery_status: status.as_str().to_owned(),
            scheduled_delivery: new.scheduled_delivery,
            is_read: false,
            read_at: None,
        };
        self.messages
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError> {
        let messages = self.messages.read().await;
        Ok(messages
            .get(&message_id)
            .filter(|record| record.tenant_id == tenant_id)
            .cloned())
    }

    async fn message_for_delivery(
        &self,
        message_id: Uuid,
    ) -> Result<Option<MessageRecord>, ChatError> {
        Ok(self.messages.read().await.get(&message_id).cloned())
    }

    async fn mark_read(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, ChatError> {
        let mut messages = self.messages.write().await;
        let Some(record) = messages
            .get_mut(&message_id)
            .filter(|record| record.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        record.is_read = true;
        record.read_at = Some(read_at);
        Ok(Some(record.clone()))
    }

    async fn set_message_status(
        &self,
        message_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), ChatError> {
        let mut messages = self.messages.write().await;
        if let Some(record) = messages.get_mut(&message_id) {
            record.delivery_status = status.as_str().to_owned();
        }
        Ok(())
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let messages = self.messages.read().await;
        let mut due: Vec<_> = messages
            .values()
            .filter(|record| record.status() == DeliveryStatus::Scheduled)
            .filter(|record| record.scheduled_delivery.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|record| record.scheduled_delivery);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn promote_scheduled(&self, message_id: Uuid) -> Result<bool, ChatError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&message_id) {
            Some(record) if record.status() == DeliveryStatus::Scheduled => {
                record.delivery_status = DeliveryStatus::Delivered.as_str().to_owned();
                record.scheduled_delivery = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enqueue_delivery(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<(), ChatError> {
        let entry = DeliveryQueueEntry {
            id: Uuid::new_v4(),
            message_id,
            recipient_id,
            status: QueueStatus::Pending.as_str().to_owned(),
            attempts: 0,
            last_attempt: None,
            created_at: Utc::now(),
        };
        self.queue.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn pending_deliveries(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<DeliveryQueueEntry>, ChatError> {
        let queue = self.queue.read().await;
        let mut pending: Vec<_> = queue
            .values()
            .filter(|entry| entry.queue_status() == QueueStatus::Pending)
            .filter(|entry| entry.attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by_key(|entry| entry.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn begin_delivery_attempt(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, ChatError> {
        let mut queue = self.queue.write().await;
        let entry = queue
            .get_mut(&entry_id)
            .ok_or_else(|| ChatError::Storage(anyhow::anyhow!("queue entry {entry_id} missing")))?;
        entry.status = QueueStatus::Processing.as_str().to_owned();
        entry.attempts += 1;
        entry.last_attempt = Some(now);
        Ok(entry.attempts)
    }

    async fn set_delivery_entry_status(
        &self,
        entry_id: Uuid,
        status: QueueStatus,
    ) -> Result<(), ChatError> {
        let mut queue = self.queue.write().await;
        if let Some(entry) = queue.get_mut(&entry_id) {
            entry.status = status.as_str().to_owned();
        }
        Ok(())
    }
}

/// Build the outbound payload for a stored message, enriched with the
/// sender's display fields when a profile row exists.
pub fn message_broadcast(
    record: &MessageRecord,
    profile: Option<&UserProfile>,
) -> MessageBroadcast {
    MessageBroadcast {
        id: record.id,
        conversation_id: record.conversation_id,
        content: record.content.clone(),
        sender_id: record.sender_id,
        sender_name: profile
            .map(|profile| profile.display().to_owned())
            .unwrap_or_else(|| record.sender_id.to_string()),
        sender_avatar: profile.and_then(|profile| profile.avatar_url.clone()),
        created_at: record.created_at,
        delivery_status: record.status(),
        is_read: record.is_read,
        attachments: record.attachments.clone(),
    }
}

/// Routes decoded commands to their handlers and owns the fan-out and
/// presence logic.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    echo_to_sender: bool,
    queue_offline_deliveries: bool,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            registry,
            echo_to_sender: config.echo_to_sender,
            queue_offline_deliveries: config.queue_offline_deliveries,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn handle_command(
        &self,
        conn: &Connection,
        command: ClientCommand,
    ) -> Result<(), ChatError> {
        match command {
            ClientCommand::SendMessage(cmd) => self.send_message(conn, cmd).await,
            ClientCommand::TypingStart(cmd) => self.typing(conn, cmd.conversation_id, true).await,
            ClientCommand::TypingStop(cmd) => self.typing(conn, cmd.conversation_id, false).await,
            ClientCommand::MarkRead(cmd) => self.mark_read(conn, cmd.message_id).await,
            ClientCommand::JoinConversation(cmd) => {
                self.join_conversation(conn, cmd.conversation_id).await
            }
            ClientCommand::Ping => {
                conn.push(ServerFrame::Pong {
                    timestamp: Utc::now(),
                });
                Ok(())
            }
        }
    }

    async fn send_message(&self, conn: &Connection, cmd: SendMessage) -> Result<(), ChatError> {
        let participants = self
            .store
            .participants(conn.tenant_id, cmd.conversation_id)
            .await?;
        if !participants.contains(&conn.user_id) {
            tracing::warn!(
                user_id = %conn.user_id,
                conversation_id = %cmd.conversation_id,
                "rejected message from non-participant"
            );
            conn.push(ServerFrame::error("not authorized for this conversation"));
            return Ok(());
        }

        let stored = self
            .store
            .insert_message(NewMessage {
                conversation_id: cmd.conversation_id,
                sender_id: conn.user_id,
                tenant_id: conn.tenant_id,
                content: cmd.content,
                attachments: cmd.attachments,
                scheduled_delivery: None,
            })
            .await?;

        let profile = self.store.profile(conn.tenant_id, conn.user_id).await?;
        let frame = ServerFrame::NewMessage(message_broadcast(&stored, profile.as_ref()));

        let mut pushed = 0usize;
        for participant in &participants {
            if *participant == conn.user_id && !self.echo_to_sender {
                continue;
            }
            if self.registry.push_frame(*participant, frame.clone()).await {
                pushed += 1;
            } else if self.queue_offline_deliveries && *participant != conn.user_id {
                if let Err(err) = self.store.enqueue_delivery(stored.id, *participant).await {
                    tracing::warn!(
                        ?err,
                        message_id = %stored.id,
                        recipient_id = %participant,
                        "failed to enqueue offline delivery"
                    );
                }
            }
        }

        conn.push(ServerFrame::MessageSent {
            message_id: stored.id,
            timestamp: Utc::now(),
        });
        tracing::debug!(
            message_id = %stored.id,
            conversation_id = %cmd.conversation_id,
            pushed,
            "message persisted and fanned out"
        );
        Ok(())
    }

    async fn typing(
        &self,
        conn: &Connection,
        conversation_id: Uuid,
        started: bool,
    ) -> Result<(), ChatError> {
        let participants = self
            .store
            .participants(conn.tenant_id, conversation_id)
            .await?;
        if !participants.contains(&conn.user_id) {
            // Ephemeral indicator from a non-participant: nothing to do.
            return Ok(());
        }

        let timestamp = Utc::now();
        let frame = if started {
            ServerFrame::UserTyping {
                conversation_id,
                user_id: conn.user_id,
                timestamp,
            }
        } else {
            ServerFrame::UserStoppedTyping {
                conversation_id,
                user_id: conn.user_id,
                timestamp,
            }
        };

        for participant in participants {
            if participant != conn.user_id {
                self.registry.push_frame(participant, frame.clone()).await;
            }
        }
        Ok(())
    }

    async fn mark_read(&self, conn: &Connection, message_id: Uuid) -> Result<(), ChatError> {
        let Some(message) = self.store.message(conn.tenant_id, message_id).await? else {
            conn.push(ServerFrame::error("message not found"));
            return Ok(());
        };

        let participants = self
            .store
            .participants(conn.tenant_id, message.conversation_id)
            .await?;
        if !participants.contains(&conn.user_id) {
            conn.push(ServerFrame::error("not authorized for this conversation"));
            return Ok(());
        }

        let read_at = Utc::now();
        self.store
            .mark_read(conn.tenant_id, message_id, read_at)
            .await?;

        self.registry
            .push_frame(
                message.sender_id,
                ServerFrame::MessageRead {
                    message_id,
                    read_by: conn.user_id,
                    timestamp: read_at,
                },
            )
            .await;
        Ok(())
    }

    async fn join_conversation(
        &self,
        conn: &Connection,
        conversation_id: Uuid,
    ) -> Result<(), ChatError> {
        let participants = self
            .store
            .participants(conn.tenant_id, conversation_id)
            .await?;
        if !participants.contains(&conn.user_id) {
            conn.push(ServerFrame::error("not authorized for this conversation"));
            return Ok(());
        }

        conn.join(conversation_id);

        let timestamp = Utc::now();
        let frame = ServerFrame::UserJoinedConversation {
            conversation_id,
            user_id: conn.user_id,
            timestamp,
        };
        for participant in participants {
            if participant != conn.user_id {
                self.registry.push_frame(participant, frame.clone()).await;
            }
        }
        Ok(())
    }

    /// Tell every live co-participant that `user_id` went online or offline.
    /// Returns how many connections were notified.
    pub async fn broadcast_status(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        status: PresenceStatus,
    ) -> Result<usize, ChatError> {
        let others = self.store.co_participants(tenant_id, user_id).await?;
        let frame = ServerFrame::UserStatusChanged {
            user_id,
            status,
            timestamp: Utc::now(),
        };

        let mut notified = 0usize;
        for other in others {
            if self.registry.push_frame(other, frame.clone()).await {
                notified += 1;
            }
        }
        tracing::debug!(user_id = %user_id, status = %status, notified, "presence broadcast");
        Ok(notified)
    }
}
