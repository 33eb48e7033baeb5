use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub mod topics;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A broadcast bus for JSON-serializable events with a bounded replay ring.
///
/// Late subscribers (for example an SSE client that just connected) can read
/// the most recent envelopes through [`Bus::replay`] before following the live
/// stream.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    replay: Arc<Mutex<VecDeque<Envelope>>>,
    replay_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 0)
    }

    pub fn new_with_replay(capacity: usize, replay_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_cap))),
            replay_cap,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        if self.replay_cap > 0 {
            match self.replay.lock() {
                Ok(mut ring) => {
                    if ring.len() == self.replay_cap {
                        ring.pop_front();
                    }
                    ring.push_back(env.clone());
                }
                Err(_) => tracing::warn!(target: "podgate::events", "replay ring poisoned"),
            }
        }
        // No receivers is fine; events are best-effort.
        let _ = self.tx.send(env);
    }

    /// Return up to `n` of the most recent envelopes, oldest first.
    pub fn replay(&self, n: usize) -> Vec<Envelope> {
        let Ok(ring) = self.replay.lock() else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
