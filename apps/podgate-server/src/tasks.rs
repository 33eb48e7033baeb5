use futures_util::FutureExt;
use std::{
    borrow::Cow,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use podgate_events::{topics, Bus};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::singleflight::Singleflight;

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
    cancel: Option<CancellationToken>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
            cancel: None,
        }
    }

    /// Token cancelled at the start of shutdown so the task can wind down
    /// before the grace period runs out.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the background loops; dropping the manager does not stop them, call
/// [`TaskManager::shutdown_with_grace`].
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn extend<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = TaskHandle>,
    {
        for task in tasks {
            self.push(task);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task, wait up to `grace` overall for them to finish, then
    /// abort whatever is left.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in &self.tasks {
            if let Some(cancel) = &task.cancel {
                cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        for task in self.tasks {
            let TaskHandle {
                name, mut handle, ..
            } = task;
            if grace.is_zero() {
                handle.abort();
                if let Err(err) = handle.await {
                    debug!(task = %name, ?err, "task join after abort failed");
                }
                continue;
            }

            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                }
            }
        }
    }
}

impl FromIterator<TaskHandle> for TaskManager {
    fn from_iter<I: IntoIterator<Item = TaskHandle>>(iter: I) -> Self {
        let mut manager = TaskManager::new();
        manager.extend(iter);
        manager
    }
}

/// Spawn a supervised background task that restarts on panic with exponential backoff.
pub fn spawn_supervised<F, Fut>(
    name: impl Into<Cow<'static, str>>,
    bus: Bus,
    mut factory: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            match result {
                Ok(()) => {
                    debug!(task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(_) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
                    bus.publish(
                        topics::TOPIC_TASK_RESTARTED,
                        &json!({
                            "task": name_for_task.as_ref(),
                            "restarts_in_window": restarts_in_window,
                            "backoff_ms": backoff_ms,
                        }),
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}

/// Drive `tick` every `period` under a single-flight claim keyed by `name`.
///
/// The tick body runs on its own task so that a slow remote call never blocks
/// the interval; a tick that finds the previous one still running is skipped.
/// Errors and panics in a tick are logged and published as `task.error`.
///
/// In-flight ticks are owned by the ticker. On shutdown the ticker stops
/// firing and waits for them; if it is aborted instead, they are aborted with
/// it and release their claim.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    bus: Bus,
    flights: Arc<Singleflight<()>>,
    tick: F,
) -> TaskHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let tick = Arc::new(tick);
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let supervisor_bus = bus.clone();
    spawn_supervised(name, supervisor_bus, move || {
        let tick = tick.clone();
        let bus = bus.clone();
        let flights = flights.clone();
        let cancel = loop_cancel.clone();
        async move {
            let mut in_flight: JoinSet<()> = JoinSet::new();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                while in_flight.try_join_next().is_some() {}
                let Some(claim) = flights.try_claim(name) else {
                    debug!(target: "podgate::tasks", task = name, "previous tick still in flight; skipping");
                    continue;
                };
                let tick = tick.clone();
                let bus = bus.clone();
                in_flight.spawn(async move {
                    let _claim = claim;
                    run_tick(name, &bus, tick()).await;
                });
            }
            debug!(target: "podgate::tasks", task = name, pending = in_flight.len(), "ticker cancelled; draining");
            while in_flight.join_next().await.is_some() {}
        }
    })
    .with_cancel(cancel)
}

async fn run_tick<Fut>(name: &str, bus: &Bus, fut: Fut)
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    let message = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{err:#}"),
        Err(_) => "tick panicked".to_string(),
    };
    error!(target: "podgate::tasks", task = name, error = %message, "background tick failed");
    bus.publish(
        topics::TOPIC_TASK_ERROR,
        &json!({"task": name, "error": message}),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn slow_tick_causes_skips_not_overlap() {
        let bus = Bus::new_with_replay(16, 16);
        let flights: Arc<Singleflight<()>> = Arc::new(Singleflight::default());
        let started = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let (s, r, o) = (started.clone(), running.clone(), overlap.clone());
        let handle = spawn_ticker(
            "test.slow",
            Duration::from_millis(100),
            bus.clone(),
            flights.clone(),
            move || {
                let (s, r, o) = (s.clone(), r.clone(), o.clone());
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    if r.fetch_add(1, Ordering::SeqCst) > 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(350)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let mut manager = TaskManager::new();
        manager.push(handle);
        manager.shutdown_with_grace(Duration::ZERO).await;

        let started = started.load(Ordering::SeqCst);
        assert!(started >= 2, "ticks should keep firing, got {started}");
        assert!(started < 10, "slow ticks must be skipped, got {started}");
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_tick_in_flight() {
        let bus = Bus::new_with_replay(16, 16);
        let flights: Arc<Singleflight<()>> = Arc::new(Singleflight::default());
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (s, f) = (started.clone(), finished.clone());
        let handle = spawn_ticker(
            "test.drain",
            Duration::from_millis(100),
            bus,
            flights.clone(),
            move || {
                let (s, f) = (s.clone(), f.clone());
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        TaskManager::from_iter([handle])
            .shutdown_with_grace(Duration::from_secs(5))
            .await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!flights.in_flight("test.drain"));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tick_is_aborted_and_releases_its_claim() {
        struct Dropped(Arc<AtomicUsize>);
        impl Drop for Dropped {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = Bus::new_with_replay(16, 16);
        let flights: Arc<Singleflight<()>> = Arc::new(Singleflight::default());
        let dropped = Arc::new(AtomicUsize::new(0));

        let d = dropped.clone();
        let handle = spawn_ticker(
            "test.stuck",
            Duration::from_millis(100),
            bus,
            flights.clone(),
            move || {
                let guard = Dropped(d.clone());
                async move {
                    let _guard = guard;
                    std::future::pending::<()>().await;
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flights.in_flight("test.stuck"));
        TaskManager::from_iter([handle])
            .shutdown_with_grace(Duration::from_millis(200))
            .await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!flights.in_flight("test.stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_errors_reach_the_bus() {
        let bus = Bus::new_with_replay(16, 16);
        let flights: Arc<Singleflight<()>> = Arc::new(Singleflight::default());
        let handle = spawn_ticker(
            "test.failing",
            Duration::from_millis(50),
            bus.clone(),
            flights,
            || async { Err(anyhow::anyhow!("store unavailable")) },
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        TaskManager::from_iter([handle])
            .shutdown_with_grace(Duration::ZERO)
            .await;

        let events = bus.replay(16);
        let err = events
            .iter()
            .find(|e| e.kind == topics::TOPIC_TASK_ERROR)
            .expect("task.error event");
        assert_eq!(err.payload["task"], "test.failing");
        assert_eq!(err.payload["error"], "store unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn supervised_task_restarts_after_panic() {
        let bus = Bus::new_with_replay(16, 16);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let handle = spawn_supervised("test.panicky", bus.clone(), move || {
            let r = r.clone();
            async move {
                if r.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        TaskManager::from_iter([handle])
            .shutdown_with_grace(Duration::from_millis(10))
            .await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(bus
            .replay(16)
            .iter()
            .any(|e| e.kind == topics::TOPIC_TASK_RESTARTED));
    }
}
