//! Container Record and the values that travel alongside it (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One published port mapping, ordered as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub host_ip: Option<String>,
    pub protocol: String,
}

/// Container status as surfaced to external observers (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl From<&str> for ContainerStatus {
    fn from(value: &str) -> Self {
        match value {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// The per-container update state machine (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    UpdateAvailable,
    Updating,
    Updated,
    Failed,
}

impl Default for UpdateState {
    fn default() -> Self {
        UpdateState::Idle
    }
}

impl UpdateState {
    /// Whether `self -> next` is a legal edge in the §4.5 diagram.
    /// `update_state` is never transitioned backwards without passing
    /// through `idle` or `failed` (spec §4.2 invariant).
    pub fn can_transition_to(self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, Idle)
                | (Checking, UpdateAvailable)
                | (UpdateAvailable, Updating)
                | (UpdateAvailable, Idle)
                | (Updating, Updated)
                | (Updating, Failed)
                | (Updated, Idle)
                | (Failed, Idle)
                // operator-visible manual re-entry points
                | (Idle, UpdateAvailable)
                | (Failed, Checking)
        )
    }
}

/// Raw configuration captured at `inspect()` time: not itself a spec.md
/// named field, but the substrate `env_fingerprint` hashes over and the
/// Update Engine needs to derive a recreation spec (spec §4.5 step 3,
/// §9 `env_fingerprint` definition).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfigSnapshot {
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// What the agent knows about one container (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub env_fingerprint: Option<String>,
    pub update_state: UpdateState,
    pub update_state_changed_at: DateTime<Utc>,
    pub update_last_error: Option<String>,

    /// Internal: the config inputs `env_fingerprint` was computed over,
    /// retained so the Update Engine can derive a recreation spec without
    /// re-inspecting the runtime mid-apply. Not part of the external
    /// record representation.
    #[serde(skip)]
    pub config_snapshot: Option<ContainerConfigSnapshot>,
}

/// A single add/update/remove event describing one registry mutation,
/// suitable for fan-out to the dashboard (spec §4.2 `subscribe()`).
#[derive(Debug, Clone)]
pub enum RegistryDelta {
    Added(ContainerRecord),
    Updated { old: ContainerRecord, new: ContainerRecord },
    Removed(ContainerRecord),
}

impl RegistryDelta {
    pub fn container_id(&self) -> &str {
        match self {
            RegistryDelta::Added(r) => &r.id,
            RegistryDelta::Updated { new, .. } => &new.id,
            RegistryDelta::Removed(r) => &r.id,
        }
    }
}
