//! Monitor Loop (C4): the single cooperative task that reconciles the
//! runtime's container listing against the registry at `check_interval`
//! (spec §4.4).

mod diff;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::events::{EventBus, EventKind};
use crate::registry::{ContainerConfigSnapshot, ContainerRecord, Observation, Registry};
use crate::runtime::{ContainerDetail, RuntimeAdapter};
use crate::updater::fingerprint;

pub use diff::{classify, ClassifiedDiff};

pub struct MonitorLoop {
    registry: Arc<Registry>,
    events: EventBus,
    runtime: Arc<dyn RuntimeAdapter>,
    config: SharedConfig,
    was_unavailable: AtomicBool,
}

impl MonitorLoop {
    pub fn new(registry: Arc<Registry>, events: EventBus, runtime: Arc<dyn RuntimeAdapter>, config: SharedConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            runtime,
            config,
            was_unavailable: AtomicBool::new(false),
        })
    }

    /// Runs until `cancel` fires. Exits after the current tick completes,
    /// or immediately if idle (spec §5).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("monitor loop starting");
        loop {
            let interval = self.config.read().check_interval();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("monitor loop stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let outcome = match self.runtime.list().await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !self.was_unavailable.swap(true, Ordering::SeqCst) {
                    self.events.emit(EventKind::RuntimeUnavailable, None, json!({ "error": e.to_string() }));
                }
                // Registry is not mutated while the runtime is down; a
                // transient outage must not spuriously unregister containers.
                return;
            }
        };

        if self.was_unavailable.swap(false, Ordering::SeqCst) {
            self.events.emit(EventKind::RuntimeRecovered, None, json!({}));
        }

        for (id, message) in &outcome.errors {
            warn!(container_id = %id, error = %message, "partial listing failure, skipping entry this tick");
        }

        let config = self.config.read().clone();
        let observed: Vec<_> = outcome
            .summaries
            .into_iter()
            .filter(|s| config.matches_label_filter(&s.labels))
            .collect();

        let current = self.registry.snapshot();
        let diff = classify(&current, &observed);

        let mut batch = Vec::new();

        for id in &diff.to_add {
            match self.runtime.inspect(id).await {
                Ok(detail) => batch.push(Observation::Add(record_from_detail(detail))),
                Err(e) => warn!(container_id = %id, error = %e, "inspect failed for new container, deferring to next tick"),
            }
        }

        for id in &diff.to_update {
            match self.runtime.inspect(id).await {
                Ok(detail) => batch.push(Observation::Update(record_from_detail(detail))),
                Err(e) => warn!(container_id = %id, error = %e, "inspect failed for changed container, deferring to next tick"),
            }
        }

        for id in &diff.to_remove {
            batch.push(Observation::Remove(id.clone()));
        }

        if !batch.is_empty() {
            self.registry.apply_observation(batch);
        }
    }
}

fn record_from_detail(detail: ContainerDetail) -> ContainerRecord {
    let env_fingerprint = fingerprint::compute(&detail.image_ref, &detail.env, &detail.mounts, &detail.ports, &detail.labels);

    ContainerRecord {
        id: detail.id,
        name: detail.name,
        image_ref: detail.image_ref,
        image_digest: detail.image_digest,
        status: detail.status,
        created_at: detail.created_at,
        started_at: detail.started_at,
        last_seen_at: chrono::Utc::now(),
        labels: detail.labels,
        ports: detail.ports.clone(),
        env_fingerprint: Some(env_fingerprint),
        update_state: Default::default(),
        update_state_changed_at: chrono::Utc::now(),
        update_last_error: None,
        config_snapshot: Some(ContainerConfigSnapshot {
            env: detail.env,
            mounts: detail.mounts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfiguration;
    use crate::runtime::FakeRuntime;
    use std::collections::HashMap;

    fn detail(id: &str) -> ContainerDetail {
        ContainerDetail {
            id: id.to_string(),
            name: format!("container-{id}"),
            image_ref: "app:1".to_string(),
            image_digest: Some("sha256:aaa".to_string()),
            status: crate::registry::ContainerStatus::Running,
            created_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            labels: HashMap::new(),
            ports: Vec::new(),
            env: HashMap::new(),
            mounts: Vec::new(),
        }
    }

    fn shared_config() -> SharedConfig {
        Arc::new(parking_lot::RwLock::new(AgentConfiguration::default()))
    }

    #[tokio::test]
    async fn tick_registers_newly_observed_container() {
        let events = EventBus::new(16);
        let registry = Arc::new(Registry::new(events.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed(detail("a"));

        let monitor = MonitorLoop::new(registry.clone(), events, runtime, shared_config());
        monitor.tick().await;

        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_some());
    }

    #[tokio::test]
    async fn tick_removes_container_absent_from_runtime() {
        let events = EventBus::new(16);
        let registry = Arc::new(Registry::new(events.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed(detail("a"));

        let monitor = MonitorLoop::new(registry.clone(), events, runtime.clone(), shared_config());
        monitor.tick().await;
        assert_eq!(registry.len(), 1);

        runtime.remove("a", true).await.unwrap();
        monitor.tick().await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn tick_skips_label_filtered_containers() {
        let events = EventBus::new(16);
        let registry = Arc::new(Registry::new(events.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed(detail("a"));

        let mut config = AgentConfiguration::default();
        config.label_filter = Some("tier=^backend$".to_string());
        let monitor = MonitorLoop::new(registry.clone(), events, runtime, Arc::new(parking_lot::RwLock::new(config)));
        monitor.tick().await;

        assert_eq!(registry.len(), 0);
    }
}
