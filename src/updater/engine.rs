//! Per-container update state machine driver and bounded apply worker
//! pool (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::SharedConfig;
use crate::events::{EventBus, EventKind};
use crate::registry::{Registry, RegistryError, UpdateState};
use crate::runtime::{RecreateSpec, RuntimeAdapter, RuntimeError};
use crate::system::Locker;

const STOP_GRACE: Duration = Duration::from_secs(10);
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);
const START_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const APPLY_HARD_CEILING: Duration = Duration::from_secs(120);
const HISTORY_CAP: usize = 200;

/// One completed or attempted update (spec §3). Appended once finalised;
/// never mutated after that (FIFO-evicted past `HISTORY_CAP`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub container_id: String,
    pub old_image_digest: Option<String>,
    pub new_image_digest: Option<String>,
    pub outcome: UpdateOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    Failed,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration not replicable: {0}")]
    ConfigNotReplicable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<RegistryError> for UpdateError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => UpdateError::NotFound(id),
            RegistryError::InvalidTransition(msg) => UpdateError::Conflict(msg),
        }
    }
}

pub struct UpdateEngine {
    registry: Arc<Registry>,
    events: EventBus,
    runtime: Arc<dyn RuntimeAdapter>,
    config: SharedConfig,
    locks: DashMap<String, Arc<Locker>>,
    worker_permits: Arc<Semaphore>,
    cleanup: bool,
    history: RwLock<VecDeque<UpdateRecord>>,
}

impl UpdateEngine {
    pub fn new(
        registry: Arc<Registry>,
        events: EventBus,
        runtime: Arc<dyn RuntimeAdapter>,
        config: SharedConfig,
        max_parallel_updates: usize,
        cleanup: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            runtime,
            config,
            locks: DashMap::new(),
            worker_permits: Arc::new(Semaphore::new(max_parallel_updates.max(1))),
            cleanup,
            history: RwLock::new(VecDeque::new()),
        })
    }

    fn lock_for(&self, id: &str) -> Arc<Locker> {
        self.locks.entry(id.to_string()).or_insert_with(|| Arc::new(Locker::new())).clone()
    }

    /// Last `limit` update records, newest first (`GET /updates`).
    pub fn history(&self, limit: usize) -> Vec<UpdateRecord> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    fn record_history(&self, record: UpdateRecord) {
        let mut history = self.history.write();
        history.push_back(record);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    /// Check cycle step (spec §4.5): pull the image, compare digests,
    /// transition `idle -> checking -> {idle, update_available}`. When a new
    /// digest is found and `auto_update` is set, immediately requests the
    /// apply as well (`update_available --(auto_update=true)--> updating`).
    pub async fn check_container(self: &Arc<Self>, id: &str) -> Result<(), UpdateError> {
        let record = self.registry.get(id).ok_or_else(|| UpdateError::NotFound(id.to_string()))?;
        self.registry.set_update_state(id, UpdateState::Checking, None)?;

        match self.runtime.pull(&record.image_ref).await {
            Ok(new_digest) => {
                if record.image_digest.as_deref() != Some(new_digest.as_str()) {
                    self.registry.set_update_state(id, UpdateState::UpdateAvailable, None)?;
                    self.events.emit(
                        EventKind::UpdateAvailable,
                        Some(id.to_string()),
                        json!({ "old_digest": record.image_digest, "new_digest": new_digest }),
                    );
                    if self.config.read().auto_update {
                        if let Err(e) = self.request_update(id).await {
                            warn!(container_id = %id, error = %e, "auto_update request failed");
                        }
                    }
                } else {
                    self.registry.set_update_state(id, UpdateState::Idle, None)?;
                }
                Ok(())
            }
            Err(e) => {
                // A failed check reverts to idle rather than stranding the
                // container in `checking`; the next scheduled sweep retries.
                let _ = self.registry.set_update_state(id, UpdateState::Idle, Some(e.to_string()));
                Err(UpdateError::Runtime(e))
            }
        }
    }

    /// Scans every container due a check (idle for at least
    /// `update_interval`) and runs its check cycle.
    pub async fn run_check_sweep(self: &Arc<Self>, update_interval: Duration) {
        let now = Utc::now();
        let due: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| {
                r.update_state == UpdateState::Idle
                    && now.signed_duration_since(r.update_state_changed_at)
                        >= chrono::Duration::from_std(update_interval).unwrap_or(chrono::Duration::zero())
            })
            .map(|r| r.id)
            .collect();

        for id in due {
            if let Err(e) = self.check_container(&id).await {
                warn!(container_id = %id, error = %e, "update check cycle failed");
            }
        }
    }

    /// Forces an immediate check cycle for every monitored container,
    /// bypassing the `update_interval` pacing (`POST /check-updates`).
    pub async fn force_check_sweep(self: &Arc<Self>) {
        let ids: Vec<String> = self.registry.snapshot().into_iter().map(|r| r.id).collect();
        for id in ids {
            if let Err(e) = self.check_container(&id).await {
                warn!(container_id = %id, error = %e, "forced check cycle failed");
            }
        }
    }

    /// Enqueues the apply procedure for `id` (`POST /containers/{id}/update`).
    /// Validates and performs the state transition synchronously so the
    /// caller gets an immediate `NotFound`/`Conflict`; the apply itself runs
    /// on the bounded worker pool and its outcome is observable via events.
    pub async fn request_update(self: &Arc<Self>, id: &str) -> Result<(), UpdateError> {
        let record = self.registry.get(id).ok_or_else(|| UpdateError::NotFound(id.to_string()))?;

        match record.update_state {
            UpdateState::UpdateAvailable => {
                self.registry.set_update_state(id, UpdateState::Updating, None)?;
            }
            UpdateState::Idle => {
                // "manual command" forces checking -> update_available
                // regardless of digest comparison (spec §4.5 diagram).
                self.registry.set_update_state(id, UpdateState::Checking, None)?;
                self.registry.set_update_state(id, UpdateState::UpdateAvailable, None)?;
                self.registry.set_update_state(id, UpdateState::Updating, None)?;
            }
            other => {
                return Err(UpdateError::Conflict(format!("container is {other:?}, not update_available or idle")));
            }
        }

        let engine = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            engine.run_apply(id).await;
        });

        Ok(())
    }

    async fn run_apply(self: Arc<Self>, id: String) {
        let lock = self.lock_for(&id);
        let _container_guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(_) => return, // lock poisoned during shutdown
        };
        let _fleet_permit = match self.worker_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };

        let started_at = Utc::now();
        let old_digest = self.registry.get(&id).and_then(|r| r.image_digest);

        let (outcome, new_digest, error) = match tokio::time::timeout(APPLY_HARD_CEILING, self.apply_procedure(&id)).await {
            Ok(Ok(new_digest)) => (UpdateOutcome::Applied, Some(new_digest), None),
            Ok(Err(e)) => {
                let message = e.to_string();
                self.fail_update(&id, &message).await;
                (UpdateOutcome::Failed, None, Some(message))
            }
            Err(_) => {
                let message = "apply procedure exceeded 120s hard ceiling".to_string();
                self.fail_update(&id, &message).await;
                (UpdateOutcome::Failed, None, Some(message))
            }
        };

        self.record_history(UpdateRecord {
            container_id: id,
            old_image_digest: old_digest,
            new_image_digest: new_digest,
            outcome,
            started_at,
            finished_at: Utc::now(),
            error,
        });
    }

    /// Returns the new image digest on success.
    async fn apply_procedure(&self, id: &str) -> Result<String, UpdateError> {
        self.events.emit(EventKind::UpdateStarted, Some(id.to_string()), json!({}));

        let record = self.registry.get(id).ok_or_else(|| UpdateError::NotFound(id.to_string()))?;

        // Step 2: re-pull, idempotent, ensures the image is still present.
        let new_digest = self.runtime.pull(&record.image_ref).await?;

        // Step 3: derive the recreation spec. No config_snapshot means the
        // inspection that would back a safe recreation never completed.
        let snapshot = record
            .config_snapshot
            .clone()
            .ok_or_else(|| UpdateError::ConfigNotReplicable("no configuration snapshot captured".to_string()))?;

        let spec = RecreateSpec {
            name: record.name.clone(),
            image_ref: record.image_ref.clone(),
            env: snapshot.env,
            mounts: snapshot.mounts,
            ports: record.ports.clone(),
            labels: record.labels.clone(),
        };

        let old_digest = record.image_digest.clone();

        // Step 4: stop.
        if let Err(e) = self.runtime.stop(id, STOP_GRACE).await {
            return self.rollback_and_fail(id, None, UpdateError::Runtime(e)).await;
        }

        // Step 5: create.
        let new_id = match self.runtime.create(&spec).await {
            Ok(new_id) => new_id,
            Err(e) => return self.rollback_and_fail(id, None, UpdateError::Runtime(e)).await,
        };

        // Step 6: start and wait for running, bounded.
        if let Err(e) = self.runtime.start(&new_id).await {
            return self.rollback_and_fail(id, Some(&new_id), UpdateError::Runtime(e)).await;
        }
        if let Err(e) = self.wait_until_running(&new_id).await {
            return self.rollback_and_fail(id, Some(&new_id), e).await;
        }

        // Step 7: success path.
        if let Err(e) = self.runtime.remove(id, true).await {
            warn!(container_id = %id, error = %e, "old container removal failed after successful update");
        }
        if self.cleanup {
            if let Some(digest) = old_digest {
                self.runtime.image_remove(&digest).await;
            }
        }

        self.events.emit(
            EventKind::UpdateApplied,
            Some(new_id.clone()),
            json!({ "old_container_id": id, "new_container_id": new_id, "new_digest": new_digest }),
        );
        self.registry.set_update_state(id, UpdateState::Updated, None).ok();
        info!(old_container_id = %id, new_container_id = %new_id, "update applied");
        Ok(new_digest)
    }

    async fn wait_until_running(&self, id: &str) -> Result<(), UpdateError> {
        let deadline = tokio::time::Instant::now() + START_POLL_TIMEOUT;
        loop {
            match self.runtime.inspect(id).await {
                Ok(detail) if detail.status == crate::registry::ContainerStatus::Running => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(UpdateError::Runtime(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(UpdateError::Timeout(format!("container {id} did not reach running")));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    /// Best-effort rollback (step 8): restore the prior running container,
    /// then mark the original id `failed`.
    async fn rollback_and_fail(&self, old_id: &str, new_id: Option<&str>, error: UpdateError) -> Result<String, UpdateError> {
        if let Some(new_id) = new_id {
            if let Err(e) = self.runtime.remove(new_id, true).await {
                warn!(container_id = %new_id, error = %e, "failed to remove half-created replacement");
            }
        }
        if let Err(e) = self.runtime.start(old_id).await {
            error!(container_id = %old_id, error = %e, "rollback start failed, container may be stopped");
        }
        Err(error)
    }

    async fn fail_update(&self, id: &str, message: &str) {
        self.events.emit(EventKind::UpdateFailed, Some(id.to_string()), json!({ "error": message }));
        if let Err(e) = self.registry.set_update_state(id, UpdateState::Failed, Some(message.to_string())) {
            warn!(container_id = %id, error = %e, "could not record failed update state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ContainerConfigSnapshot, ContainerRecord, ContainerStatus};
    use crate::runtime::FakeRuntime;

    fn sample_record(id: &str, image_ref: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: format!("container-{id}"),
            image_ref: image_ref.to_string(),
            image_digest: Some("sha256:old".to_string()),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            last_seen_at: Utc::now(),
            labels: HashMap::new(),
            ports: Vec::new(),
            env_fingerprint: Some("fp".to_string()),
            update_state: UpdateState::Idle,
            update_state_changed_at: Utc::now() - chrono::Duration::hours(1),
            update_last_error: None,
            config_snapshot: Some(ContainerConfigSnapshot::default()),
        }
    }

    fn build_engine() -> (Arc<UpdateEngine>, Arc<Registry>, Arc<FakeRuntime>) {
        let events = EventBus::new(64);
        let registry = Arc::new(Registry::new(events.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        let config = Arc::new(RwLock::new(crate::config::AgentConfiguration::default()));
        let engine = UpdateEngine::new(registry.clone(), events, runtime.clone(), config, 1, true);
        (engine, registry, runtime)
    }

    #[tokio::test]
    async fn check_cycle_detects_new_digest() {
        let (engine, registry, runtime) = build_engine();
        registry.apply_observation(vec![crate::registry::Observation::Add(sample_record("a", "app:1"))]);
        runtime.set_pull_digest("app:1", "sha256:new");

        engine.check_container("a").await.unwrap();
        assert_eq!(registry.get("a").unwrap().update_state, UpdateState::UpdateAvailable);
    }

    #[tokio::test]
    async fn check_cycle_stays_idle_when_digest_unchanged() {
        let (engine, registry, runtime) = build_engine();
        registry.apply_observation(vec![crate::registry::Observation::Add(sample_record("a", "app:1"))]);
        runtime.set_pull_digest("app:1", "sha256:old");

        engine.check_container("a").await.unwrap();
        assert_eq!(registry.get("a").unwrap().update_state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn missing_config_snapshot_is_refused() {
        let (engine, registry, _runtime) = build_engine();
        let mut record = sample_record("a", "app:1");
        record.config_snapshot = None;
        record.update_state = UpdateState::UpdateAvailable;
        record.update_state_changed_at = Utc::now();
        registry.apply_observation(vec![crate::registry::Observation::Add(record)]);
        registry.set_update_state("a", UpdateState::UpdateAvailable, None).ok();

        let result = engine.apply_procedure("a").await;
        assert!(matches!(result, Err(UpdateError::ConfigNotReplicable(_))));
    }

    #[tokio::test]
    async fn request_update_rejects_conflicting_state() {
        let (engine, registry, _runtime) = build_engine();
        let mut record = sample_record("a", "app:1");
        record.update_state = UpdateState::Updating;
        registry.apply_observation(vec![crate::registry::Observation::Add(record)]);
        registry.set_update_state("a", UpdateState::Checking, None).ok();
        registry.set_update_state("a", UpdateState::UpdateAvailable, None).ok();
        registry.set_update_state("a", UpdateState::Updating, None).ok();

        let result = engine.request_update("a").await;
        assert!(matches!(result, Err(UpdateError::Conflict(_))));
    }
}
