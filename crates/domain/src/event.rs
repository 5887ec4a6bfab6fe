//! Published event record and the stable topic names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// An event published on the bus. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dotted topic, e.g. `"alert.system.task_failed"`.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// The skill (or core component) that produced the event.
    pub source: String,
    pub payload: Map<String, Value>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, severity: Severity) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            payload: Map::new(),
            severity,
            event_id: None,
        }
    }

    /// Builder-style payload entry.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Stable event topics published by the runtime core.
pub mod topics {
    pub const SYSTEM_ERROR: &str = "alert.system.error";
    pub const TASK_FAILED: &str = "alert.system.task_failed";
    pub const SUBAGENT_SPAWNED: &str = "subagent.spawned";
    pub const SUBAGENT_RUNNING: &str = "subagent.running";
    pub const SUBAGENT_COMPLETED: &str = "subagent.completed";
    pub const SUBAGENT_FAILED: &str = "subagent.failed";
    pub const SUBAGENT_CANCELLED: &str = "subagent.cancelled";
    pub const SUBAGENT_TIMEOUT: &str = "subagent.timeout";
}
