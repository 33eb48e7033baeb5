use std::sync::Arc;

use podgate_events::Bus;
use podgate_kernel::Kernel;

use crate::{
    auth::{self, TokenVerifier},
    clock::{Clock, SystemClock},
    config::ControlConfig,
    controller::PodController,
    inference::{InferenceBackend, LlamaClient},
    model_state::ModelStateStore,
    pod_control::{PodControl, RunpodClient},
    presence::PresenceTracker,
    queue::QueueGate,
    singleflight::Singleflight,
    worker::{QueueWorker, WorkerSettings},
};

#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<ControlConfig>,
    bus: Bus,
    kernel: Kernel,
    pod: Arc<dyn PodControl>,
    verifier: Arc<dyn TokenVerifier>,
    presence: PresenceTracker,
    model_state: ModelStateStore,
    controller: PodController,
    queue: QueueGate,
    worker: QueueWorker,
    task_flights: Arc<Singleflight<()>>,
}

impl AppState {
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn pod(&self) -> Arc<dyn PodControl> {
        self.pod.clone()
    }

    pub fn verifier(&self) -> &dyn TokenVerifier {
        self.verifier.as_ref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn model_state(&self) -> &ModelStateStore {
        &self.model_state
    }

    pub fn controller(&self) -> PodController {
        self.controller.clone()
    }

    pub fn queue(&self) -> &QueueGate {
        &self.queue
    }

    pub fn worker(&self) -> QueueWorker {
        self.worker.clone()
    }

    pub fn task_flights(&self) -> Arc<Singleflight<()>> {
        self.task_flights.clone()
    }

    pub(crate) fn builder(config: ControlConfig, kernel: Kernel, bus: Bus) -> AppStateBuilder {
        AppStateBuilder {
            config,
            kernel,
            bus,
            clock: None,
            pod: None,
            inference: None,
            verifier: None,
        }
    }
}

/// Collaborators left unset are built from the config.
pub(crate) struct AppStateBuilder {
    config: ControlConfig,
    kernel: Kernel,
    bus: Bus,
    clock: Option<Arc<dyn Clock>>,
    pod: Option<Arc<dyn PodControl>>,
    inference: Option<Arc<dyn InferenceBackend>>,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl AppStateBuilder {
    #[allow(dead_code)]
    pub(crate) fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[allow(dead_code)]
    pub(crate) fn with_pod(mut self, pod: Arc<dyn PodControl>) -> Self {
        self.pod = Some(pod);
        self
    }

    #[allow(dead_code)]
    pub(crate) fn with_inference(mut self, inference: Arc<dyn InferenceBackend>) -> Self {
        self.inference = Some(inference);
        self
    }

    #[allow(dead_code)]
    pub(crate) fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub(crate) fn build(self) -> anyhow::Result<AppState> {
        let AppStateBuilder {
            config,
            kernel,
            bus,
            clock,
            pod,
            inference,
            verifier,
        } = self;
        let timeout = config.request_timeout();
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let pod: Arc<dyn PodControl> = match pod {
            Some(pod) => pod,
            None => Arc::new(RunpodClient::new(&config.pod, timeout)?),
        };
        let inference: Arc<dyn InferenceBackend> = match inference {
            Some(inference) => inference,
            None => Arc::new(LlamaClient::new(&config.inference.base_url, timeout)?),
        };
        let verifier = match verifier {
            Some(verifier) => verifier,
            None => auth::verifier_from_config(&config.auth, timeout)?,
        };

        let presence = PresenceTracker::new(kernel.clone(), clock.clone(), bus.clone());
        let model_state = ModelStateStore::new(kernel.clone(), clock.clone());
        let controller = PodController::new(
            presence.clone(),
            model_state.clone(),
            pod.clone(),
            bus.clone(),
            clock.clone(),
            config.presence.window_secs,
            config.idle.shutdown_after_secs,
        );
        let queue = QueueGate::new(
            kernel.clone(),
            clock.clone(),
            bus.clone(),
            config.queue.max_size,
        );
        let worker = QueueWorker::new(
            kernel.clone(),
            model_state.clone(),
            inference,
            clock,
            bus.clone(),
            WorkerSettings::from(&config),
        );

        Ok(AppState {
            config: Arc::new(config),
            bus,
            kernel,
            pod,
            verifier,
            presence,
            model_state,
            controller,
            queue,
            worker,
            task_flights: Arc::new(Singleflight::default()),
        })
    }
}
