use std::sync::Arc;

use podgate_events::{topics, Bus};
use podgate_kernel::{Kernel, QueueItem, QueueStatus};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    clock::Clock,
    config::ControlConfig,
    inference::{ChatCompletion, ChatCompletionRequest, ChatMessage, InferenceBackend, InferenceError},
    model_state::ModelStateStore,
    prompt,
    tasks::{self, TaskHandle},
};

pub(crate) const WORKER_TASK: &str = "queue.worker";

#[derive(Debug, thiserror::Error)]
pub enum WorkerItemError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Knobs the worker reads per item.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub model: String,
    pub default_system_prompt: String,
    pub default_temperature: f64,
    pub history_limit: usize,
    pub error_max_chars: usize,
}

impl From<&ControlConfig> for WorkerSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            model: cfg.inference.model.clone(),
            default_system_prompt: cfg.inference.default_system_prompt.clone(),
            default_temperature: cfg.inference.default_temperature,
            history_limit: cfg.queue.history_limit,
            error_max_chars: cfg.queue.error_max_chars,
        }
    }
}

/// Single consumer of the request queue.
#[derive(Clone)]
pub struct QueueWorker {
    kernel: Kernel,
    model_state: ModelStateStore,
    inference: Arc<dyn InferenceBackend>,
    clock: Arc<dyn Clock>,
    bus: Bus,
    settings: WorkerSettings,
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

impl QueueWorker {
    pub fn new(
        kernel: Kernel,
        model_state: ModelStateStore,
        inference: Arc<dyn InferenceBackend>,
        clock: Arc<dyn Clock>,
        bus: Bus,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            kernel,
            model_state,
            inference,
            clock,
            bus,
            settings,
        }
    }

    /// Claim and process at most one item.
    ///
    /// Returns the item in its terminal state, or `None` when the queue was
    /// empty. Per-item failures end in `failed`; only store failures while
    /// claiming or finishing escape as `Err`.
    pub async fn process_once(&self) -> anyhow::Result<Option<QueueItem>> {
        let Some(item) = self.kernel.claim_next_queued_async(self.clock.now()).await? else {
            return Ok(None);
        };
        debug!(target: "podgate::worker", id = %item.id, user_id = %item.user_id, "claimed queue item");
        self.bus
            .publish(
                topics::TOPIC_QUEUE_RUNNING,
                &json!({"id": item.id, "user_id": item.user_id}),
            );

        if let Err(err) = self.model_state.record_request().await {
            warn!(target: "podgate::worker", id = %item.id, error = %err, "failed to bump last_request_at");
        }

        let outcome = self.run_item(&item).await;
        let finished_at = self.clock.now();
        let (status, meta, error) = match outcome {
            Ok(completion) => {
                if let Err(err) = self.append_turns(&item, &completion).await {
                    warn!(target: "podgate::worker", id = %item.id, error = %err, "failed to persist conversation turns");
                }
                let meta = json!({"tokens": completion.usage, "reply": completion.reply});
                (QueueStatus::Done, Some(meta), None)
            }
            Err(err) => {
                let text = truncate_chars(&err.to_string(), self.settings.error_max_chars);
                warn!(target: "podgate::worker", id = %item.id, error = %text, "queue item failed");
                (QueueStatus::Failed, None, Some(text))
            }
        };

        let updated = self
            .kernel
            .finish_queue_item_async(&item.id, status, meta.clone(), error.clone(), finished_at)
            .await?;
        if !updated {
            warn!(target: "podgate::worker", id = %item.id, "item left running state before it finished");
        }
        let topic = match status {
            QueueStatus::Done => topics::TOPIC_QUEUE_DONE,
            _ => topics::TOPIC_QUEUE_FAILED,
        };
        self.bus.publish(
            topic,
            &json!({"id": item.id, "user_id": item.user_id, "error": error}),
        );
        info!(target: "podgate::worker", id = %item.id, status = %status, "queue item finished");

        Ok(Some(QueueItem {
            status,
            finished_at: Some(finished_at),
            result_meta: meta,
            error,
            ..item
        }))
    }

    async fn run_item(&self, item: &QueueItem) -> Result<ChatCompletion, WorkerItemError> {
        let settings = self
            .kernel
            .get_user_settings_async(&item.user_id)
            .await?
            .unwrap_or_default();
        let system_prompt = settings
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_system_prompt.clone());
        let temperature = settings
            .temperature
            .unwrap_or(self.settings.default_temperature);

        let history: Vec<ChatMessage> = match &item.conversation_id {
            Some(conv) => self
                .kernel
                .recent_messages_async(conv, self.settings.history_limit as i64)
                .await?
                .into_iter()
                .map(|m| ChatMessage::new(m.role, m.content))
                .collect(),
            None => Vec::new(),
        };

        let request = ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages: prompt::build_messages(
                &system_prompt,
                settings.memory.as_deref(),
                &history,
                &item.prompt,
            ),
            temperature,
            stream: false,
        };
        Ok(self.inference.complete(&request).await?)
    }

    async fn append_turns(&self, item: &QueueItem, completion: &ChatCompletion) -> anyhow::Result<()> {
        let Some(conv) = &item.conversation_id else {
            return Ok(());
        };
        self.kernel
            .append_message_async(conv, "user", &item.prompt, item.created_at)
            .await?;
        if let Some(reply) = &completion.reply {
            self.kernel
                .append_message_async(conv, "assistant", reply, self.clock.now())
                .await?;
        }
        Ok(())
    }
}

/// Drain one item per tick.
pub(crate) fn start_queue_worker(state: AppState) -> TaskHandle {
    let worker = state.worker();
    tasks::spawn_ticker(
        WORKER_TASK,
        state.config().worker_tick(),
        state.bus(),
        state.task_flights(),
        move || {
            let worker = worker.clone();
            async move {
                worker.process_once().await?;
                Ok(())
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::FakeInference;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use podgate_kernel::UserSettings;
    use serde_json::Value;

    struct Harness {
        _dir: tempfile::TempDir,
        kernel: Kernel,
        clock: Arc<ManualClock>,
        inference: Arc<FakeInference>,
        worker: QueueWorker,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let inference = Arc::new(FakeInference::default());
        let worker = QueueWorker::new(
            kernel.clone(),
            ModelStateStore::new(kernel.clone(), clock.clone()),
            inference.clone(),
            clock.clone(),
            Bus::new_with_replay(32, 32),
            WorkerSettings::from(&ControlConfig::default()),
        );
        Harness {
            _dir: dir,
            kernel,
            clock,
            inference,
            worker,
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars(&"ü".repeat(600), 500).chars().count(), 500);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let h = harness();
        assert!(h.worker.process_once().await.unwrap().is_none());
        assert!(h.inference.requests().is_empty());
        assert_eq!(h.kernel.get_model_state().unwrap().last_request_at, None);
    }

    #[tokio::test]
    async fn success_marks_done_and_bumps_idle_clock() {
        let h = harness();
        h.inference.push_reply("hi there", Some(serde_json::json!({"total_tokens": 9})));
        let queued = h.kernel.insert_queue_item("alice", None, "hello", t0()).unwrap();
        h.clock.advance(Duration::seconds(3));

        let done = h.worker.process_once().await.unwrap().unwrap();
        assert_eq!(done.id, queued.id);
        assert_eq!(done.status, QueueStatus::Done);

        let stored = h.kernel.get_queue_item(&queued.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Done);
        assert_eq!(stored.started_at, Some(t0() + Duration::seconds(3)));
        let meta = stored.result_meta.unwrap();
        assert_eq!(meta["tokens"]["total_tokens"], 9);
        assert_eq!(meta["reply"], "hi there");
        assert_eq!(
            h.kernel.get_model_state().unwrap().last_request_at,
            Some(t0() + Duration::seconds(3))
        );

        let req = &h.inference.requests()[0];
        assert_eq!(req.model, "local-model");
        assert!(!req.stream);
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.messages[0], ChatMessage::new("system", "You are a helpful assistant."));
        assert_eq!(req.messages.last().unwrap(), &ChatMessage::new("user", "hello"));
    }

    #[tokio::test]
    async fn inference_failure_marks_failed_with_bounded_error() {
        let h = harness();
        h.inference.push_error(503, &"x".repeat(2_000));
        let queued = h.kernel.insert_queue_item("alice", None, "hello", t0()).unwrap();

        let failed = h.worker.process_once().await.unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        let stored = h.kernel.get_queue_item(&queued.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        let err = stored.error.unwrap();
        assert!(err.chars().count() <= 500);
        assert!(err.contains("503"));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn only_recent_history_is_sent_oldest_first() {
        let h = harness();
        for i in 0..25 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            h.kernel
                .append_message("c1", role, &format!("m{i}"), t0() + Duration::seconds(i))
                .unwrap();
        }
        h.inference.push_reply("ok", None);
        h.kernel
            .insert_queue_item("alice", Some("c1"), "next", t0() + Duration::seconds(30))
            .unwrap();
        h.worker.process_once().await.unwrap();

        let msgs = &h.inference.requests()[0].messages;
        // system + 20 history + user turn
        assert_eq!(msgs.len(), 22);
        assert_eq!(msgs[1].content, "m5");
        assert_eq!(msgs[20].content, "m24");
        assert_eq!(msgs[21].content, "next");
    }

    #[tokio::test]
    async fn user_settings_shape_the_request_and_turns_are_kept() {
        let h = harness();
        h.kernel
            .upsert_user_settings(
                &UserSettings {
                    user_id: "alice".into(),
                    system_prompt: Some("Answer in French.".into()),
                    memory: Some("vegetarian".into()),
                    temperature: Some(0.2),
                },
                t0(),
            )
            .unwrap();
        h.inference.push_reply("bonjour", None);
        h.kernel
            .insert_queue_item("alice", Some("c9"), "hello", t0())
            .unwrap();
        let done = h.worker.process_once().await.unwrap().unwrap();
        assert_eq!(done.result_meta.unwrap()["tokens"], Value::Null);

        let req = &h.inference.requests()[0];
        assert_eq!(req.temperature, 0.2);
        assert_eq!(req.messages[0].content, "Answer in French.");
        assert!(req.messages[1].content.ends_with("\nvegetarian"));

        let convo = h.kernel.recent_messages("c9", 20).unwrap();
        let turns: Vec<_> = convo.iter().map(|m| (m.role.as_str(), m.content.as_str())).collect();
        assert_eq!(turns, [("user", "hello"), ("assistant", "bonjour")]);
    }

    #[tokio::test]
    async fn one_item_per_call_in_fifo_order() {
        let h = harness();
        h.inference.push_reply("1", None);
        h.inference.push_reply("2", None);
        let first = h.kernel.insert_queue_item("a", None, "p1", t0()).unwrap();
        let second = h
            .kernel
            .insert_queue_item("b", None, "p2", t0() + Duration::seconds(1))
            .unwrap();

        let got = h.worker.process_once().await.unwrap().unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(
            h.kernel.get_queue_item(&second.id).unwrap().unwrap().status,
            QueueStatus::Queued
        );
        let got = h.worker.process_once().await.unwrap().unwrap();
        assert_eq!(got.id, second.id);
    }

    #[tokio::test]
    async fn malformed_inference_response_marks_failed() {
        use axum::{routing::post, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { "<html>not json</html>" }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let llama = crate::inference::LlamaClient::new(
            &format!("http://{addr}"),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let worker = QueueWorker::new(
            kernel.clone(),
            ModelStateStore::new(kernel.clone(), clock.clone()),
            Arc::new(llama),
            clock,
            Bus::new_with_replay(8, 8),
            WorkerSettings::from(&ControlConfig::default()),
        );
        let queued = kernel
            .insert_queue_item("alice", Some("c1"), "hello", t0())
            .unwrap();

        let out = worker.process_once().await.unwrap().unwrap();
        assert_eq!(out.status, QueueStatus::Failed);
        let stored = kernel.get_queue_item(&queued.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert!(stored
            .error
            .unwrap()
            .starts_with("inference response malformed"));
        assert!(kernel.recent_messages("c1", 20).unwrap().is_empty());
    }
}
