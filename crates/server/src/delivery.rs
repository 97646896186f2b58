//! The delivery queue processor: a recurring pass over not-yet-delivered
//! queue entries, pushing each to its recipient's live connection and
//! tracking attempt state. Retries run at the loop cadence with no
//! backoff, up to the attempt cap; after that the entry is terminally
//! failed and needs external intervention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crewline_core::{DeliveryStatus, QueueStatus, ServerFrame};
use crewline_storage::DeliveryQueueEntry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::{message_broadcast, ChatError, ChatStore};
use crate::config::ChatConfig;
use crate::registry::ConnectionRegistry;

pub struct DeliveryQueueProcessor {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    batch_size: i64,
    max_attempts: i32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeliveryPass {
    pub delivered: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl DeliveryQueueProcessor {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            registry,
            batch_size: config.delivery_batch_size,
            max_attempts: config.delivery_max_attempts,
        }
    }

    /// Run passes at a fixed cadence until shutdown. The first pass fires
    /// immediately.
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(pass) if pass.delivered + pass.requeued + pass.failed > 0 => {
                                tracing::debug!(
                                    delivered = pass.delivered,
                                    requeued = pass.requeued,
                                    failed = pass.failed,
                                    "delivery queue pass finished"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(?err, "delivery queue pass failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("delivery queue processor stopped");
        })
    }

    pub async fn run_once(&self) -> Result<DeliveryPass, ChatError> {
        let entries = self
            .store
            .pending_deliveries(self.batch_size, self.max_attempts)
            .await?;

        let mut pass = DeliveryPass::default();
        for entry in entries {
            let attempts = match self
                .store
                .begin_delivery_attempt(entry.id, Utc::now())
                .await
            {
                Ok(attempts) => attempts,
                Err(err) => {
                    tracing::warn!(?err, entry_id = %entry.id, "failed to claim delivery entry");
                    continue;
                }
            };

            match self.attempt(&entry).await {
                Ok(true) => {
                    self.store
                        .set_delivery_entry_status(entry.id, QueueStatus::Delivered)
                        .await?;
                    self.store
                        .set_message_status(entry.message_id, DeliveryStatus::Delivered)
                        .await?;
                    pass.delivered += 1;
                }
                Ok(false) => {
                    self.settle_retry(&entry, attempts, None, &mut pass).await;
                }
                Err(err) => {
                    self.settle_retry(&entry, attempts, Some(err), &mut pass)
                        .await;
                }
            }
        }
        Ok(pass)
    }

    /// Push the queued message to the recipient. `Ok(false)` means the
    /// recipient has no live connection right now.
    async fn attempt(&self, entry: &DeliveryQueueEntry) -> Result<bool, ChatError> {
        let message = self
            .store
            .message_for_delivery(entry.message_id)
            .await?
            .ok_or(ChatError::MessageNotFound)?;
        let profile = self
            .store
            .profile(message.tenant_id, message.sender_id)
            .await?;
        let frame = ServerFrame::NewMessage(message_broadcast(&message, profile.as_ref()));
        Ok(self.registry.push_frame(entry.recipient_id, frame).await)
    }

    async fn settle_retry(
        &self,
        entry: &DeliveryQueueEntry,
        attempts: i32,
        err: Option<ChatError>,
        pass: &mut DeliveryPass,
    ) {
        if let Some(err) = err {
            tracing::warn!(?err, entry_id = %entry.id, attempts, "delivery attempt errored");
        }

        if attempts >= self.max_attempts {
            if let Err(err) = self
                .store
                .set_delivery_entry_status(entry.id, QueueStatus::Failed)
                .await
            {
                tracing::warn!(?err, entry_id = %entry.id, "failed to mark entry failed");
            }
            if let Err(err) = self
                .store
                .set_message_status(entry.message_id, DeliveryStatus::Failed)
                .await
            {
                tracing::warn!(?err, message_id = %entry.message_id, "failed to mark message failed");
            }
            pass.failed += 1;
        } else {
            if let Err(err) = self
                .store
                .set_delivery_entry_status(entry.id, QueueStatus::Pending)
                .await
            {
                tracing::warn!(?err, entry_id = %entry.id, "failed to requeue entry");
            }
            pass.requeued += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tests::{drain_frames, ChatHarness};
    use crewline_storage::NewMessage;
    use uuid::Uuid;

    async fn seeded_message(harness: &ChatHarness, sender: Uuid, recipient: Uuid) -> Uuid {
        let conversation = harness
            .store
            .add_conversation(harness.tenant_id, &[sender, recipient])
            .await;
        let record = harness
            .store
            .insert_message(NewMessage {
                conversation_id: conversation,
                sender_id: sender,
                tenant_id: harness.tenant_id,
                content: "queued up".into(),
                attachments: None,
                scheduled_delivery: None,
            })
            .await
            .expect("message inserts");
        record.id
    }

    fn processor(harness: &ChatHarness) -> DeliveryQueueProcessor {
        DeliveryQueueProcessor::new(
            harness.store.clone(),
            harness.registry.clone(),
            &ChatConfig::default(),
        )
    }

    #[tokio::test]
    async fn delivers_on_the_first_pass_with_the_recipient_online() {
        let harness = ChatHarness::new();
        let sender = harness
            .store
            .add_profile(harness.tenant_id, "sender", Some("Sender"))
            .await;
        let recipient = harness
            .store
            .add_profile(harness.tenant_id, "recipient", None)
            .await;
        let message_id = seeded_message(&harness, sender, recipient).await;
        harness
            .store
            .enqueue_delivery(message_id, recipient)
            .await
            .expect("enqueue");

        let (_conn, mut rx) = harness.connect(recipient).await;

        let pass = processor(&harness).run_once().await.expect("pass runs");
        assert_eq!(
            pass,
            DeliveryPass {
                delivered: 1,
                requeued: 0,
                failed: 0
            }
        );

        let frames = drain_frames(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerFrame::NewMessage(message) if message.id == message_id
        ));

        let entries = harness.store.queue_entries().await;
        assert_eq!(entries[0].queue_status(), QueueStatus::Delivered);
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].last_attempt.is_some());

        let record = harness
            .store
            .message(harness.tenant_id, message_id)
            .await
            .unwrap()
            .expect("message exists");
        assert_eq!(record.status(), DeliveryStatus::Delivered);

        // A delivered entry is terminal: the next pass touches nothing.
        let pass = processor(&harness).run_once().await.expect("pass runs");
        assert_eq!(pass, DeliveryPass::default());
    }

    #[tokio::test]
    async fn fails_exactly_on_the_third_unsuccessful_attempt() {
        let harness = ChatHarness::new();
        let sender = harness
            .store
            .add_profile(harness.tenant_id, "sender", None)
            .await;
        let recipient = harness
            .store
            .add_profile(harness.tenant_id, "recipient", None)
            .await;
        let message_id = seeded_message(&harness, sender, recipient).await;
        harness
            .store
            .enqueue_delivery(message_id, recipient)
            .await
            .expect("enqueue");

        let processor = processor(&harness);

        // Recipient stays offline: two retries leave the entry pending.
        for expected_attempts in 1..=2 {
            let pass = processor.run_once().await.expect("pass runs");
            assert_eq!(pass.requeued, 1, "attempt {expected_attempts} requeues");
            assert_eq!(pass.failed, 0, "attempt {expected_attempts} must not fail");
            let entries = harness.store.queue_entries().await;
            assert_eq!(entries[0].queue_status(), QueueStatus::Pending);
            assert_eq!(entries[0].attempts, expected_attempts);
        }

        // The third attempt hits the cap.
        let pass = processor.run_once().await.expect("pass runs");
        assert_eq!(pass.failed, 1);
        let entries = harness.store.queue_entries().await;
        assert_eq!(entries[0].queue_status(), QueueStatus::Failed);
        assert_eq!(entries[0].attempts, 3);

        let record = harness
            .store
            .message(harness.tenant_id, message_id)
            .await
            .unwrap()
            .expect("message exists");
        assert_eq!(record.status(), DeliveryStatus::Failed);

        // Terminal: nothing left for a fourth pass.
        let pass = processor.run_once().await.expect("pass runs");
        assert_eq!(pass, DeliveryPass::default());
    }

    #[tokio::test]
    async fn an_entry_for_a_missing_message_burns_out_like_any_failure() {
        let harness = ChatHarness::new();
        let recipient = harness
            .store
            .add_profile(harness.tenant_id, "recipient", None)
            .await;
        harness
            .store
            .enqueue_delivery(Uuid::new_v4(), recipient)
            .await
            .expect("enqueue");
        let (_conn, _rx) = harness.connect(recipient).await;

        let processor = processor(&harness);
        for _ in 0..2 {
            let pass = processor.run_once().await.expect("pass runs");
            assert_eq!(pass.requeued, 1);
        }
        let pass = processor.run_once().await.expect("pass runs");
        assert_eq!(pass.failed, 1);
        assert_eq!(
            harness.store.queue_entries().await[0].queue_status(),
            QueueStatus::Failed
        );
    }
}
