use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use podgate_events::Bus;
use podgate_kernel::Kernel;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::Notify;

use crate::{
    app_state::AppState,
    auth::StaticTokenVerifier,
    clock::ManualClock,
    config::ControlConfig,
    inference::{ChatCompletion, ChatCompletionRequest, InferenceBackend, InferenceError},
    pod_control::{PodControl, PodControlError, PodInfo},
};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) mod env {
    use super::*;

    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner()),
            saved: HashMap::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

/// Scriptable pod API. `calls()` is `(describe, start, stop)`.
pub(crate) struct FakePod {
    desired: Mutex<Option<String>>,
    describes: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_describe: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    hold: Mutex<Option<Arc<Notify>>>,
}

impl FakePod {
    pub(crate) fn new(desired: Option<&str>) -> Self {
        Self {
            desired: Mutex::new(desired.map(str::to_string)),
            describes: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_describe: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            hold: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> (usize, usize, usize) {
        (
            self.describes.load(Ordering::SeqCst),
            self.starts.load(Ordering::SeqCst),
            self.stops.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn fail_describe(&self, on: bool) {
        self.fail_describe.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_start(&self, on: bool) {
        self.fail_start.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_stop(&self, on: bool) {
        self.fail_stop.store(on, Ordering::SeqCst);
    }

    /// Make `describe` wait until the returned notify fires.
    pub(crate) fn hold_describe(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn remote_error() -> PodControlError {
        PodControlError::Remote {
            status: 502,
            detail: "fake pod api down".into(),
        }
    }
}

#[async_trait]
impl PodControl for FakePod {
    async fn describe(&self) -> Result<PodInfo, PodControlError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(Self::remote_error());
        }
        Ok(PodInfo {
            id: "pod-test".into(),
            desired_status: self.desired.lock().unwrap().clone(),
            runtime: None,
        })
    }

    async fn start(&self) -> Result<(), PodControlError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Self::remote_error());
        }
        *self.desired.lock().unwrap() = Some("RUNNING".into());
        Ok(())
    }

    async fn stop(&self) -> Result<(), PodControlError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Self::remote_error());
        }
        *self.desired.lock().unwrap() = Some("EXITED".into());
        Ok(())
    }
}

/// Inference endpoint that replays scripted outcomes and records requests.
/// With nothing scripted it answers `"ok"`.
#[derive(Default)]
pub(crate) struct FakeInference {
    script: Mutex<VecDeque<Result<ChatCompletion, (u16, String)>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl FakeInference {
    pub(crate) fn push_reply(&self, reply: &str, usage: Option<serde_json::Value>) {
        self.script.lock().unwrap().push_back(Ok(ChatCompletion {
            reply: Some(reply.to_string()),
            usage,
        }));
    }

    pub(crate) fn push_error(&self, status: u16, body: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err((status, body.to_string())));
    }

    pub(crate) fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeInference {
    async fn complete(&self, req: &ChatCompletionRequest) -> Result<ChatCompletion, InferenceError> {
        self.requests.lock().unwrap().push(req.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(out)) => Ok(out),
            Some(Err((status, body))) => Err(InferenceError::Status { status, body }),
            None => Ok(ChatCompletion {
                reply: Some("ok".into()),
                usage: None,
            }),
        }
    }
}

pub(crate) const ALICE_TOKEN: &str = "tok-alice";
pub(crate) const BOB_TOKEN: &str = "tok-bob";

pub(crate) struct TestContext {
    _dir: tempfile::TempDir,
    pub state: AppState,
    pub pod: Arc<FakePod>,
    pub inference: Arc<FakeInference>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub(crate) fn router(&self) -> axum::Router {
        crate::router::build_router().0.with_state(self.state.clone())
    }
}

/// App state over a temp store, fake collaborators, a manual clock and two
/// static users (`alice`, `bob`).
pub(crate) fn context(queue_capacity: usize) -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    let mut config = ControlConfig::default();
    config.state_dir = dir.path().to_path_buf();
    config.queue.max_size = queue_capacity;

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
    ));
    let pod = Arc::new(FakePod::new(Some("EXITED")));
    let inference = Arc::new(FakeInference::default());
    let tokens: BTreeMap<String, String> = [
        (ALICE_TOKEN.to_string(), "alice".to_string()),
        (BOB_TOKEN.to_string(), "bob".to_string()),
    ]
    .into_iter()
    .collect();

    let state = AppState::builder(config, kernel, Bus::new_with_replay(64, 64))
        .with_clock(clock.clone())
        .with_pod(pod.clone())
        .with_inference(inference.clone())
        .with_verifier(Arc::new(StaticTokenVerifier::new(tokens)))
        .build()
        .expect("build state");

    TestContext {
        _dir: dir,
        state,
        pod,
        inference,
        clock,
    }
}
