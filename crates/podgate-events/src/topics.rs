//! Event topic constants published on the control-plane bus.
//!
//! Keep this list grouped by component and favor dot.case names.

// Pod lifecycle
pub const TOPIC_POD_STARTING: &str = "pod.starting";
pub const TOPIC_POD_RUNNING: &str = "pod.running";
pub const TOPIC_POD_STOPPING: &str = "pod.stopping";
pub const TOPIC_POD_CONTROL_FAILED: &str = "pod.control.failed";

// Presence
pub const TOPIC_PRESENCE_SEEN: &str = "presence.seen";

// Queue
pub const TOPIC_QUEUE_ADMITTED: &str = "queue.admitted";
pub const TOPIC_QUEUE_REJECTED: &str = "queue.rejected";
pub const TOPIC_QUEUE_RUNNING: &str = "queue.running";
pub const TOPIC_QUEUE_DONE: &str = "queue.done";
pub const TOPIC_QUEUE_FAILED: &str = "queue.failed";

// Background tasks
pub const TOPIC_TASK_ERROR: &str = "task.error";
pub const TOPIC_TASK_RESTARTED: &str = "task.restarted";
