//! The Registry: authoritative single-owner map, written only through
//! `apply_observation` (Monitor Loop) and `set_update_state` (Update
//! Engine) — the one-way data flow spec §9 calls out as the fix for the
//! Monitor/Update cyclic dependency in the source.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::{EventBus, EventKind};

use super::record::{ContainerRecord, RegistryDelta, UpdateState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("invalid update_state transition: {0}")]
    InvalidTransition(String),
}

/// One reconciled observation for a single container id (spec §4.4).
pub enum Observation {
    Add(ContainerRecord),
    Update(ContainerRecord),
    Remove(String),
}

pub struct Registry {
    records: DashMap<String, ContainerRecord>,
    delta_tx: broadcast::Sender<RegistryDelta>,
    _delta_rx: broadcast::Receiver<RegistryDelta>,
    events: EventBus,
}

impl Registry {
    pub fn new(events: EventBus) -> Self {
        let (delta_tx, _delta_rx) = broadcast::channel(1024);
        Self {
            records: DashMap::new(),
            delta_tx,
            _delta_rx,
            events,
        }
    }

    /// A consistent, immutable copy of all records at this instant.
    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<ContainerRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryDelta> {
        self.delta_tx.subscribe()
    }

    /// Single-writer reconciliation entry point (Monitor Loop only).
    /// Applies the batch in order — `add` before `update` before `remove`
    /// per container id is guaranteed because the caller orders the batch
    /// that way; this function preserves submission order.
    pub fn apply_observation(&self, batch: Vec<Observation>) {
        for observation in batch {
            match observation {
                Observation::Add(record) => self.apply_add(record),
                Observation::Update(record) => self.apply_update(record),
                Observation::Remove(id) => self.apply_remove(&id),
            }
        }
    }

    fn apply_add(&self, record: ContainerRecord) {
        if self.records.contains_key(&record.id) {
            // Already known; treat as an update instead of double-adding.
            self.apply_update(record);
            return;
        }
        let id = record.id.clone();
        self.events.emit(
            EventKind::ContainerRegistered,
            Some(id.clone()),
            serde_json::json!({ "name": record.name, "image_ref": record.image_ref }),
        );
        self.records.insert(id, record.clone());
        let _ = self.delta_tx.send(RegistryDelta::Added(record));
    }

    fn apply_update(&self, mut incoming: ContainerRecord) {
        let Some(mut entry) = self.records.get_mut(&incoming.id) else {
            self.apply_add(incoming);
            return;
        };
        let old = entry.value().clone();

        // Monitor reconciliation owns these fields; update_state and its
        // bookkeeping remain the Update Engine's narrow side-channel.
        incoming.update_state = old.update_state;
        incoming.update_state_changed_at = old.update_state_changed_at;
        incoming.update_last_error = old.update_last_error.clone();

        let status_changed = old.status != incoming.status;
        *entry.value_mut() = incoming.clone();
        drop(entry);

        if status_changed {
            self.events.emit(
                EventKind::ContainerStatusChanged,
                Some(incoming.id.clone()),
                serde_json::json!({ "old_status": old.status, "new_status": incoming.status }),
            );
        }

        let _ = self.delta_tx.send(RegistryDelta::Updated { old, new: incoming });
    }

    fn apply_remove(&self, id: &str) {
        let Some((_, record)) = self.records.remove(id) else {
            return;
        };
        if record.update_state == UpdateState::Updating {
            // Defer: the Update Engine is recreating this container.
            // Re-insert; a remove observation should not have reached us
            // for an in-flight update, but this keeps the invariant true
            // even if the caller's diff was stale.
            self.records.insert(record.id.clone(), record);
            return;
        }
        self.events.emit(EventKind::ContainerUnregistered, Some(id.to_string()), serde_json::json!({}));
        let _ = self.delta_tx.send(RegistryDelta::Removed(record));
    }

    /// Narrow mutator consumed only by the Update Engine. Refuses any
    /// transition not legal in the §4.5 state diagram.
    pub fn set_update_state(
        &self,
        id: &str,
        new_state: UpdateState,
        error: Option<String>,
    ) -> Result<ContainerRecord, RegistryError> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let current = entry.value().update_state;
        if !current.can_transition_to(new_state) {
            return Err(RegistryError::InvalidTransition(format!(
                "{current:?} -> {new_state:?} is not a legal update_state transition"
            )));
        }

        entry.value_mut().update_state = new_state;
        entry.value_mut().update_state_changed_at = Utc::now();
        entry.value_mut().update_last_error = error;
        Ok(entry.value().clone())
    }

    /// Record the latest observed image digest and config snapshot for a
    /// container, used by the Update Engine's check cycle without routing
    /// through the monitor's full reconciliation pass.
    pub fn refresh_digest(&self, id: &str, digest: String) -> Result<(), RegistryError> {
        let mut entry = self.records.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.value_mut().image_digest = Some(digest);
        Ok(())
    }
}

/// Helper for building the label map passed through HTTP responses.
pub fn labels_without_internal(labels: &HashMap<String, String>) -> HashMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !k.starts_with("fleetwatch."))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::record::ContainerStatus;

    fn sample_record(id: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: format!("container-{id}"),
            image_ref: "app:1".to_string(),
            image_digest: Some("sha256:aaa".to_string()),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            last_seen_at: Utc::now(),
            labels: HashMap::new(),
            ports: Vec::new(),
            env_fingerprint: Some("fp".to_string()),
            update_state: UpdateState::Idle,
            update_state_changed_at: Utc::now(),
            update_last_error: None,
            config_snapshot: None,
        }
    }

    #[test]
    fn add_then_update_preserves_update_state() {
        let registry = Registry::new(EventBus::new(16));
        registry.apply_observation(vec![Observation::Add(sample_record("a"))]);
        registry.set_update_state("a", UpdateState::Checking, None).unwrap();

        let mut updated = sample_record("a");
        updated.status = ContainerStatus::Exited;
        registry.apply_observation(vec![Observation::Update(updated)]);

        let record = registry.get("a").unwrap();
        assert_eq!(record.status, ContainerStatus::Exited);
        assert_eq!(record.update_state, UpdateState::Checking);
    }

    #[test]
    fn remove_is_deferred_while_updating() {
        let registry = Registry::new(EventBus::new(16));
        registry.apply_observation(vec![Observation::Add(sample_record("a"))]);
        registry.set_update_state("a", UpdateState::Checking, None).unwrap();
        registry.set_update_state("a", UpdateState::UpdateAvailable, None).unwrap();
        registry.set_update_state("a", UpdateState::Updating, None).unwrap();

        registry.apply_observation(vec![Observation::Remove("a".to_string())]);
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let registry = Registry::new(EventBus::new(16));
        registry.apply_observation(vec![Observation::Add(sample_record("a"))]);
        let err = registry.set_update_state("a", UpdateState::Updated, None);
        assert!(err.is_err());
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let registry = Registry::new(EventBus::new(16));
        registry.apply_observation(vec![Observation::Add(sample_record("a")), Observation::Add(sample_record("b"))]);
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.len(), 2);
    }
}
