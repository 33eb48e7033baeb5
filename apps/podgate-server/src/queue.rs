use std::sync::Arc;

use podgate_events::{topics, Bus};
use podgate_kernel::{Kernel, QueueItem};
use serde_json::json;
use tracing::info;

use crate::clock::Clock;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("queue full ({active}/{limit})")]
    QueueFull { limit: usize, active: usize },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Bounded entry point of the request queue.
///
/// The cap is global and counts queued plus running items. Counting and
/// inserting are two store calls, so concurrent submitters can overshoot the
/// cap by the number of racing callers.
#[derive(Clone)]
pub struct QueueGate {
    kernel: Kernel,
    clock: Arc<dyn Clock>,
    bus: Bus,
    max_size: usize,
}

impl QueueGate {
    pub fn new(kernel: Kernel, clock: Arc<dyn Clock>, bus: Bus, max_size: usize) -> Self {
        Self {
            kernel,
            clock,
            bus,
            max_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub async fn enqueue(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        prompt: &str,
    ) -> Result<QueueItem, AdmissionError> {
        let active = usize::try_from(self.kernel.count_queue_active_async().await?).unwrap_or(0);
        if active >= self.max_size {
            info!(target: "podgate::queue", user_id, active, limit = self.max_size, "queue full; rejecting");
            self.bus.publish(
                topics::TOPIC_QUEUE_REJECTED,
                &json!({"user_id": user_id, "active": active, "limit": self.max_size}),
            );
            return Err(AdmissionError::QueueFull {
                limit: self.max_size,
                active,
            });
        }
        let item = self
            .kernel
            .insert_queue_item_async(user_id, conversation_id, prompt, self.clock.now())
            .await?;
        self.bus.publish(
            topics::TOPIC_QUEUE_ADMITTED,
            &json!({"id": item.id, "user_id": user_id, "position": active + 1}),
        );
        Ok(item)
    }
}
