use std::sync::Arc;

use podgate_kernel::{Kernel, ModelState, ModelStatePatch, PodStatus};

use crate::clock::Clock;

/// Typed access to the singleton coordination record.
#[derive(Clone)]
pub struct ModelStateStore {
    kernel: Kernel,
    clock: Arc<dyn Clock>,
}

impl ModelStateStore {
    pub fn new(kernel: Kernel, clock: Arc<dyn Clock>) -> Self {
        Self { kernel, clock }
    }

    pub async fn snapshot(&self) -> anyhow::Result<ModelState> {
        self.kernel.get_model_state_async().await
    }

    /// Bump `last_request_at`, the only input of the idle clock.
    pub async fn record_request(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        self.apply(ModelStatePatch::default().with_last_request_at(now))
            .await
    }

    pub async fn mark_starting(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        self.apply(ModelStatePatch::pod_status(PodStatus::Starting).with_last_start_at(now))
            .await
    }

    pub async fn mark_running(&self) -> anyhow::Result<()> {
        self.apply(ModelStatePatch::pod_status(PodStatus::Running))
            .await
    }

    pub async fn mark_stopping(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        self.apply(ModelStatePatch::pod_status(PodStatus::Stopping).with_last_stop_at(now))
            .await
    }

    async fn apply(&self, patch: ModelStatePatch) -> anyhow::Result<()> {
        self.kernel
            .upsert_model_state_async(patch, self.clock.now())
            .await
    }
}
