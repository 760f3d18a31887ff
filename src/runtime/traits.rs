//! The Runtime Adapter trait and its value types (spec §4.1).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::registry::{ContainerStatus, MountBinding, PortMapping};

#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("authentication required to pull image")]
    AuthRequired,

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether this specific error is worth an automatic retry (spec §7:
    /// `RegistryUnreachable` retryable with backoff, `AuthRequired` not).
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::RegistryUnreachable(_))
    }
}

/// Lightweight summary returned by `list()`.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    /// The runtime's image id/digest for the running container, when the
    /// listing call surfaces it cheaply (spec §4.4 step 2's digest
    /// comparison uses this without requiring a full `inspect()` on every
    /// present container).
    pub image_id: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// `list()` must tolerate partial failures: yield what can be listed and
/// surface per-entry errors separately (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct ListOutcome {
    pub summaries: Vec<ContainerSummary>,
    pub errors: Vec<(String, String)>,
}

/// Full detail returned by `inspect(id)`.
#[derive(Debug, Clone)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountBinding>,
}

/// Everything needed to recreate a container with the same externally
/// observable configuration against a new image (spec §4.5 step 3).
#[derive(Debug, Clone)]
pub struct RecreateSpec {
    pub name: String,
    pub image_ref: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountBinding>,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
}

/// Polymorphic over {real daemon, in-memory fake for testing} (spec
/// §4.1). All methods are safely invokable from multiple concurrent
/// callers without external serialization.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn list(&self) -> Result<ListOutcome, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// New image digest, possibly identical to current. Retried internally
    /// on transient errors up to 3 times with exponential backoff (base
    /// 1s, cap 30s) — spec §4.5 policies.
    async fn pull(&self, image_ref: &str) -> Result<String, RuntimeError>;

    /// Idempotent on already-stopped.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Idempotent on already-running.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Creates a container from `spec`. Returns the new id.
    async fn create(&self, spec: &RecreateSpec) -> Result<String, RuntimeError>;

    /// Idempotent on missing.
    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Best-effort; must not fail the apply procedure if the image is
    /// still referenced elsewhere.
    async fn image_remove(&self, digest: &str);
}
