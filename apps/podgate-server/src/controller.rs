use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use podgate_events::{topics, Bus};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    app_state::AppState,
    clock::Clock,
    model_state::ModelStateStore,
    pod_control::{PodControl, PodControlError},
    presence::PresenceTracker,
    singleflight::Singleflight,
    tasks::{self, TaskHandle},
};

const ENSURE_KEY: &str = "pod.ensure_running";
pub(crate) const IDLE_TASK: &str = "pod.idle_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    None,
    Starting,
    Running,
    KeptRunning,
    WaitingIdleTimeout,
    Stopping,
}

/// Outcome of a controller decision, as returned to heartbeat callers.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ControlReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ControlAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReport {
    fn acted(online: bool, action: ControlAction) -> Self {
        Self {
            ok: true,
            online: Some(online),
            action: Some(action),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            online: None,
            action: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Pod(#[from] PodControlError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Start/stop decisions for the pod.
///
/// Status changes are asserted when the command is issued; the pod's actual
/// arrival in `running` or `stopped` is never observed.
#[derive(Clone)]
pub struct PodController {
    presence: PresenceTracker,
    model_state: ModelStateStore,
    pod: Arc<dyn PodControl>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    presence_window_secs: u64,
    idle_shutdown_secs: u64,
    flights: Arc<Singleflight<ControlReport>>,
}

impl PodController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        presence: PresenceTracker,
        model_state: ModelStateStore,
        pod: Arc<dyn PodControl>,
        bus: Bus,
        clock: Arc<dyn Clock>,
        presence_window_secs: u64,
        idle_shutdown_secs: u64,
    ) -> Self {
        Self {
            presence,
            model_state,
            pod,
            bus,
            clock,
            presence_window_secs,
            idle_shutdown_secs,
            flights: Arc::new(Singleflight::default()),
        }
    }

    /// Make sure the pod is up while anyone is online.
    ///
    /// Concurrent callers share one in-flight evaluation and all receive its
    /// report. Failures are reported, never raised.
    ///
    /// A caller that joins an evaluation already in flight gets a report built
    /// from a presence read that may predate its own heartbeat, so an online
    /// user can see `none`. The next heartbeat re-evaluates and starts the pod.
    pub async fn ensure_running(&self) -> ControlReport {
        self.flights
            .run(ENSURE_KEY, || async {
                match self.try_ensure_running().await {
                    Ok(report) => report,
                    Err(err) => {
                        self.report_failure("ensure_running", &err);
                        ControlReport::failed(err.to_string())
                    }
                }
            })
            .await
    }

    async fn try_ensure_running(&self) -> Result<ControlReport, ControlError> {
        if !self.presence.is_anyone_online(self.presence_window_secs).await? {
            return Ok(ControlReport::acted(false, ControlAction::None));
        }
        let pod = self.pod.describe().await?;
        if pod.needs_start() {
            self.pod.start().await?;
            self.model_state.mark_starting().await?;
            info!(target: "podgate::pod", pod_id = %pod.id, desired = ?pod.desired_status, "pod start requested");
            self.bus
                .publish(topics::TOPIC_POD_STARTING, &json!({"pod_id": pod.id}));
            return Ok(ControlReport::acted(true, ControlAction::Starting));
        }
        self.model_state.mark_running().await?;
        self.bus
            .publish(topics::TOPIC_POD_RUNNING, &json!({"pod_id": pod.id}));
        Ok(ControlReport::acted(true, ControlAction::Running))
    }

    /// Stop the pod once nobody is online and the last processed request is
    /// older than the idle threshold. A pod-control failure is logged and
    /// published before it is returned.
    pub async fn maybe_stop(&self) -> Result<ControlReport, ControlError> {
        let result = self.try_maybe_stop().await;
        if let Err(err @ ControlError::Pod(_)) = &result {
            self.report_failure("maybe_stop", err);
        }
        result
    }

    async fn try_maybe_stop(&self) -> Result<ControlReport, ControlError> {
        if self.presence.is_anyone_online(self.presence_window_secs).await? {
            return Ok(ControlReport::acted(true, ControlAction::KeptRunning));
        }
        let state = self.model_state.snapshot().await?;
        let last_request = state.last_request_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let idle = self.clock.now() - last_request;
        let threshold =
            Duration::seconds(self.idle_shutdown_secs.min(u64::from(u32::MAX)) as i64);
        if idle < threshold {
            return Ok(ControlReport::acted(false, ControlAction::WaitingIdleTimeout));
        }
        self.pod.stop().await?;
        self.model_state.mark_stopping().await?;
        info!(target: "podgate::pod", idle_secs = idle.num_seconds(), "idle timeout reached; pod stop requested");
        self.bus.publish(
            topics::TOPIC_POD_STOPPING,
            &json!({"idle_secs": idle.num_seconds()}),
        );
        Ok(ControlReport::acted(false, ControlAction::Stopping))
    }

    fn report_failure(&self, op: &str, err: &ControlError) {
        warn!(target: "podgate::pod", op, error = %err, "pod control failed");
        self.bus.publish(
            topics::TOPIC_POD_CONTROL_FAILED,
            &json!({"op": op, "error": err.to_string()}),
        );
    }
}

/// Periodic idle check. Pod-control failures are retried on the next tick;
/// store failures surface as `task.error`.
pub(crate) fn start_idle_check(state: AppState) -> TaskHandle {
    let controller = state.controller();
    tasks::spawn_ticker(
        IDLE_TASK,
        state.config().idle_check_interval(),
        state.bus(),
        state.task_flights(),
        move || {
            let controller = controller.clone();
            async move {
                match controller.maybe_stop().await {
                    Ok(report) => {
                        debug!(target: "podgate::pod", action = ?report.action, "idle check");
                        Ok(())
                    }
                    Err(ControlError::Pod(_)) => Ok(()),
                    Err(ControlError::Store(err)) => Err(err),
                }
            }
        },
    )
}
