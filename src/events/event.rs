//! Event taxonomy (spec §4.3) and the wire envelope (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The recognised domain event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "container.registered")]
    ContainerRegistered,
    #[serde(rename = "container.unregistered")]
    ContainerUnregistered,
    #[serde(rename = "container.status_changed")]
    ContainerStatusChanged,
    #[serde(rename = "update.available")]
    UpdateAvailable,
    #[serde(rename = "update.started")]
    UpdateStarted,
    #[serde(rename = "update.applied")]
    UpdateApplied,
    #[serde(rename = "update.failed")]
    UpdateFailed,
    #[serde(rename = "runtime.unavailable")]
    RuntimeUnavailable,
    #[serde(rename = "runtime.recovered")]
    RuntimeRecovered,
}

/// One domain occurrence, assigned a monotonic sequence at emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn new(sequence: u64, kind: EventKind, container_id: Option<String>, payload: Value) -> Self {
        Self {
            sequence,
            kind,
            at: Utc::now(),
            container_id,
            payload,
        }
    }
}
