use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle of a queued chat request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl QueueStatus {
    pub const ACTIVE: [QueueStatus; 2] = [QueueStatus::Queued, QueueStatus::Running];
    pub const ALL: [QueueStatus; 4] = [
        QueueStatus::Queued,
        QueueStatus::Running,
        QueueStatus::Done,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Failed)
    }

    /// queued -> running -> {done, failed}; terminal states never move.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (QueueStatus::Queued, QueueStatus::Running)
                | (QueueStatus::Running, QueueStatus::Done)
                | (QueueStatus::Running, QueueStatus::Failed)
        )
    }

    pub fn check_transition(&self, next: QueueStatus) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError::Queue {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "running" => Ok(QueueStatus::Running),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Coordination view of the remote pod. Values are asserted when a command is
/// issued, not observed from the pod itself.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Stopped => "stopped",
            PodStatus::Starting => "starting",
            PodStatus::Running => "running",
            PodStatus::Stopping => "stopping",
        }
    }

    /// `stopped` may only follow `stopped` or `stopping`; every other change is
    /// allowed because start/stop commands can be reissued from any state.
    pub fn can_transition_to(&self, next: PodStatus) -> bool {
        match next {
            PodStatus::Stopped => matches!(self, PodStatus::Stopped | PodStatus::Stopping),
            PodStatus::Starting | PodStatus::Running | PodStatus::Stopping => true,
        }
    }

    pub fn check_transition(&self, next: PodStatus) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError::Pod {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PodStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(PodStatus::Stopped),
            "starting" => Ok(PodStatus::Starting),
            "running" => Ok(PodStatus::Running),
            "stopping" => Ok(PodStatus::Stopping),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal queue transition {from} -> {to}")]
    Queue { from: QueueStatus, to: QueueStatus },
    #[error("illegal pod transition {from} -> {to}")]
    Pod { from: PodStatus, to: PodStatus },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub prompt: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ModelState {
    pub pod_status: PodStatus,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields to merge into the singleton model state. `None` leaves the stored
/// value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStatePatch {
    pub pod_status: Option<PodStatus>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
}

impl ModelStatePatch {
    pub fn pod_status(status: PodStatus) -> Self {
        Self {
            pod_status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_last_request_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_request_at = Some(at);
        self
    }

    pub fn with_last_start_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_start_at = Some(at);
        self
    }

    pub fn with_last_stop_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_stop_at = Some(at);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct UserSettings {
    pub user_id: String,
    pub system_prompt: Option<String>,
    pub memory: Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
