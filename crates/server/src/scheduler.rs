//! The scheduled message processor: promotes messages whose scheduled
//! delivery time has elapsed into the live delivery path. A missed row
//! simply waits for the next pass; the status flip keeps re-selection
//! idempotent. Kept separate from the delivery queue loop on purpose, so
//! the two idempotence guards stay isolated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crewline_core::ServerFrame;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::{message_broadcast, ChatError, ChatStore};
use crate::config::ChatConfig;
use crate::registry::ConnectionRegistry;

pub struct ScheduledMessageProcessor {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    batch_size: i64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchedulerPass {
    pub promoted: usize,
    pub pushed: usize,
    pub queued: usize,
}

impl ScheduledMessageProcessor {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            registry,
            batch_size: config.scheduled_batch_size,
        }
    }

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
                            Ok(pass) if pass.promoted > 0 => {
                                tracing::info!(
                                    promoted = pass.promoted,
                                    pushed = pass.pushed,
                                    queued = pass.queued,
                                    "scheduled messages promoted"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(?err, "scheduled message pass failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("scheduled message processor stopped");
        })
    }

    pub async fn run_once(&self) -> Result<SchedulerPass, ChatError> {
        let due = self.store.due_scheduled(Utc::now(), self.batch_size).await?;

        let mut pass = SchedulerPass::default();
        for message in due {
            // The flip is the guard: a row someone else already promoted is
            // skipped wholesale.
            if !self.store.promote_scheduled(message.id).await? {
                continue;
            }
            pass.promoted += 1;

            let participants = self
                .store
                .participants(message.tenant_id, message.conversation_id)
                .await?;
            let profile = self
                .store
                .profile(message.tenant_id, message.sender_id)
                .await?;

            let mut promoted = message.clone();
            promoted.delivery_status = crewline_core::DeliveryStatus::Delivered.as_str().to_owned();
            promoted.scheduled_delivery = None;
            let frame = ServerFrame::scheduled(message_broadcast(&promoted, profile.as_ref()));

            for participant in participants {
                if self.registry.push_frame(participant, frame.clone()).await {
                    pass.pushed += 1;
                } else {
                    // Offline at promotion time: hand the message to the
                    // delivery queue so it still arrives.
                    match self.store.enqueue_delivery(message.id, participant).await {
                        Ok(()) => pass.queued += 1,
                        Err(err) => {
                            tracing::warn!(
                                ?err,
                                message_id = %message.id,
                                recipient_id = %participant,
                                "failed to enqueue scheduled delivery"
                            );
                        }
                    }
                }
            }
        }
        Ok(pass)
    }
}
