use std::sync::Arc;

use chrono::Duration;
use podgate_events::{topics, Bus};
use podgate_kernel::Kernel;
use serde_json::json;

use crate::clock::Clock;

/// Per-user liveness backed by the `user_presence` table.
#[derive(Clone)]
pub struct PresenceTracker {
    kernel: Kernel,
    clock: Arc<dyn Clock>,
    bus: Bus,
}

impl PresenceTracker {
    pub fn new(kernel: Kernel, clock: Arc<dyn Clock>, bus: Bus) -> Self {
        Self { kernel, clock, bus }
    }

    /// Upsert `last_seen = now` for `user_id`.
    pub async fn record_heartbeat(&self, user_id: &str) -> anyhow::Result<()> {
        let now = self.clock.now();
        self.kernel.upsert_presence_async(user_id, now).await?;
        self.bus.publish(
            topics::TOPIC_PRESENCE_SEEN,
            &json!({"user_id": user_id, "at": podgate_kernel::ts(now)}),
        );
        Ok(())
    }

    /// True iff some user was seen within the last `window_secs` (inclusive).
    pub async fn is_anyone_online(&self, window_secs: u64) -> anyhow::Result<bool> {
        let window = Duration::seconds(window_secs.min(u64::from(u32::MAX)) as i64);
        let cutoff = self.clock.now() - window;
        Ok(self.kernel.count_presence_since_async(cutoff).await? > 0)
    }
}
