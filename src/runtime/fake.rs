//! In-memory fake Runtime Adapter for tests (spec §4.1 requires the
//! Runtime Adapter be polymorphic over a real daemon and a testing fake).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::registry::ContainerStatus;

use super::traits::{ContainerDetail, ContainerSummary, ListOutcome, RecreateSpec, RuntimeAdapter, RuntimeError};

#[derive(Clone)]
struct FakeContainer {
    detail: ContainerDetail,
}

/// Drives a `RuntimeAdapter` from an in-memory table instead of a real
/// container daemon. Tests seed it via `seed()` / `set_pull_result()` /
/// `fail_next_pull()` and drive ticks through the monitor/updater.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    pull_digest: Mutex<HashMap<String, String>>,
    pull_failures: Mutex<Vec<RuntimeError>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pull_digest: Mutex::new(HashMap::new()),
            pull_failures: Mutex::new(Vec::new()),
        }
    }

    pub fn seed(&self, detail: ContainerDetail) {
        self.containers.lock().insert(detail.id.clone(), FakeContainer { detail });
    }

    /// Sets the digest that `pull(image_ref)` will return for this image.
    pub fn set_pull_digest(&self, image_ref: &str, digest: &str) {
        self.pull_digest.lock().insert(image_ref.to_string(), digest.to_string());
    }

    /// Queues an error for the next `pull()` call (FIFO), to exercise
    /// retry/failure paths from the Update Engine.
    pub fn queue_pull_failure(&self, error: RuntimeError) {
        self.pull_failures.lock().push(error);
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn list(&self) -> Result<ListOutcome, RuntimeError> {
        let containers = self.containers.lock();
        let summaries = containers
            .values()
            .map(|c| ContainerSummary {
                id: c.detail.id.clone(),
                name: c.detail.name.clone(),
                image_ref: c.detail.image_ref.clone(),
                image_id: c.detail.image_digest.clone(),
                status: c.detail.status,
                created_at: c.detail.created_at,
                labels: c.detail.labels.clone(),
            })
            .collect();
        Ok(ListOutcome { summaries, errors: Vec::new() })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        self.containers
            .lock()
            .get(id)
            .map(|c| c.detail.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn pull(&self, image_ref: &str) -> Result<String, RuntimeError> {
        if let Some(error) = self.pull_failures.lock().pop() {
            return Err(error);
        }
        Ok(self
            .pull_digest
            .lock()
            .get(image_ref)
            .cloned()
            .unwrap_or_else(|| format!("sha256:fake-{image_ref}")))
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        match containers.get_mut(id) {
            Some(c) => {
                c.detail.status = ContainerStatus::Exited;
                Ok(())
            }
            None => Ok(()), // idempotent on missing
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        match containers.get_mut(id) {
            Some(c) => {
                c.detail.status = ContainerStatus::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn create(&self, spec: &RecreateSpec) -> Result<String, RuntimeError> {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let detail = ContainerDetail {
            id: id.clone(),
            name: spec.name.clone(),
            image_ref: spec.image_ref.clone(),
            image_digest: self.pull_digest.lock().get(&spec.image_ref).cloned(),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            labels: spec.labels.clone(),
            ports: spec.ports.clone(),
            env: spec.env.clone(),
            mounts: spec.mounts.clone(),
        };
        self.containers.lock().insert(id.clone(), FakeContainer { detail });
        Ok(id)
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.containers.lock().remove(id);
        Ok(())
    }

    async fn image_remove(&self, _digest: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn detail(id: &str) -> ContainerDetail {
        ContainerDetail {
            id: id.to_string(),
            name: format!("container-{id}"),
            image_ref: "app:1".to_string(),
            image_digest: Some("sha256:aaa".to_string()),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            labels: HashMap::new(),
            ports: Vec::new(),
            env: HashMap::new(),
            mounts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn seeded_container_is_listed_and_inspectable() {
        let runtime = FakeRuntime::new();
        runtime.seed(detail("a"));

        let listed = runtime.list().await.unwrap();
        assert_eq!(listed.summaries.len(), 1);

        let inspected = runtime.inspect("a").await.unwrap();
        assert_eq!(inspected.image_ref, "app:1");
    }

    #[tokio::test]
    async fn queued_pull_failure_is_returned_once() {
        let runtime = FakeRuntime::new();
        runtime.queue_pull_failure(RuntimeError::RegistryUnreachable("dns".into()));

        let first = runtime.pull("app:2").await;
        assert!(first.is_err());

        let second = runtime.pull("app:2").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn create_then_remove_round_trips() {
        let runtime = FakeRuntime::new();
        let spec = RecreateSpec {
            name: "app".to_string(),
            image_ref: "app:2".to_string(),
            env: HashMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            labels: HashMap::new(),
        };
        let id = runtime.create(&spec).await.unwrap();
        assert_eq!(runtime.container_count(), 1);

        runtime.remove(&id, true).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
    }
}
