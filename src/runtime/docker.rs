//! Bollard-backed Runtime Adapter (spec §4.1), grounded on the teacher's
//! `docker/service.rs` and `environment/docker/container.rs`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use tracing::{debug, warn};

use crate::registry::{ContainerStatus, MountBinding, PortMapping};

use super::traits::{ContainerDetail, ContainerSummary, ListOutcome, RecreateSpec, RuntimeAdapter, RuntimeError};

const MAX_PULL_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect(endpoint: &str) -> Result<Self, RuntimeError> {
        let client = if let Some(socket_path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
        } else if endpoint.starts_with("npipe://") {
            Docker::connect_with_named_pipe(endpoint, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_local_defaults()
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Self { client })
    }

    fn calculate_backoff(attempt: u32) -> Duration {
        let delay = BASE_RETRY_DELAY * 2u32.pow(attempt.saturating_sub(1));
        std::cmp::min(delay, MAX_RETRY_DELAY)
    }

    fn map_docker_error(e: bollard::errors::Error, id: &str) -> RuntimeError {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                RuntimeError::NotFound(id.to_string())
            }
            bollard::errors::Error::HyperResponseError { .. } | bollard::errors::Error::IOError { .. } => {
                RuntimeError::Unavailable(e.to_string())
            }
            _ => RuntimeError::Other(e.to_string()),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn list(&self) -> Result<ListOutcome, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let mut outcome = ListOutcome::default();
        for c in containers {
            let id = match c.id {
                Some(id) => id,
                None => continue,
            };

            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());

            let image_ref = c.image.clone().unwrap_or_default();
            let status = c.state.as_deref().map(ContainerStatus::from).unwrap_or(ContainerStatus::Unknown);
            let created_at = c
                .created
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .unwrap_or_else(Utc::now);
            let labels = c.labels.unwrap_or_default();

            outcome.summaries.push(ContainerSummary {
                id,
                name,
                image_ref,
                image_id: c.image_id,
                status,
                created_at,
                labels,
            });
        }

        Ok(outcome)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::map_docker_error(e, id))?;

        let name = info.name.unwrap_or_else(|| id.to_string()).trim_start_matches('/').to_string();
        let image_digest = info
            .image
            .as_ref()
            .and_then(|image| image.split('@').nth(1))
            .map(|d| d.to_string());

        let config = info.config.clone().unwrap_or_default();
        let image_ref = config.image.clone().unwrap_or_default();
        let labels = config.labels.clone().unwrap_or_default();

        let env: HashMap<String, String> = config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();

        let mounts = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(MountBinding {
                    source: m.source?,
                    target: m.destination?,
                    read_only: !m.rw.unwrap_or(true),
                })
            })
            .collect();

        let ports = info
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let mut parts = key.splitn(2, '/');
                let container_port: u16 = parts.next()?.parse().ok()?;
                let protocol = parts.next().unwrap_or("tcp").to_string();
                match bindings.and_then(|b| b.into_iter().next()) {
                    Some(binding) => Some(PortMapping {
                        container_port,
                        host_port: binding.host_port.and_then(|p| p.parse().ok()),
                        host_ip: binding.host_ip,
                        protocol,
                    }),
                    None => Some(PortMapping {
                        container_port,
                        host_port: None,
                        host_ip: None,
                        protocol,
                    }),
                }
            })
            .collect();

        let status = info
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(status_enum_str(s)))
            .unwrap_or(ContainerStatus::Unknown);

        let created_at: DateTime<Utc> = info
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let started_at = info
            .state
            .and_then(|s| s.started_at)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ContainerDetail {
            id: id.to_string(),
            name,
            image_ref,
            image_digest,
            status,
            created_at,
            started_at,
            labels,
            ports,
            env,
            mounts,
        })
    }

    async fn pull(&self, image_ref: &str) -> Result<String, RuntimeError> {
        let mut last_error = None;

        for attempt in 0..=MAX_PULL_RETRIES {
            if attempt > 0 {
                let delay = Self::calculate_backoff(attempt);
                debug!(image = image_ref, attempt, ?delay, "retrying image pull");
                tokio::time::sleep(delay).await;
            }

            match self.pull_once(image_ref).await {
                Ok(digest) => return Ok(digest),
                Err(e) if e.is_transient() && attempt < MAX_PULL_RETRIES => {
                    warn!(image = image_ref, attempt, error = %e, "transient pull failure, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| RuntimeError::Other("pull exhausted retries".into())))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()), // already stopped
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()), // idempotent
            Err(e) => Err(Self::map_docker_error(e, id)),
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self.client.start_container::<String>(id, None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()), // already running
            Err(e) => Err(Self::map_docker_error(e, id)),
        }
    }

    async fn create(&self, spec: &RecreateSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            if let Some(host_port) = port.host_port {
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: port.host_ip.clone(),
                        host_port: Some(host_port.to_string()),
                    }]),
                );
            }
        }

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image_ref.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::map_docker_error(e, &spec.name))?;

        Ok(response.id)
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions { force, v: false };
        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(Self::map_docker_error(e, id)),
        }
    }

    async fn image_remove(&self, digest: &str) {
        let options = RemoveImageOptions {
            force: false,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_image(digest, Some(options), None).await {
            debug!(digest, error = %e, "best-effort image cleanup skipped");
        }
    }
}

impl DockerRuntime {
    async fn pull_once(&self, image_ref: &str) -> Result<String, RuntimeError> {
        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };

        let results: Vec<_> = self
            .client
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(Self::classify_pull_error)?;

        for info in &results {
            if let Some(err) = &info.error {
                return Err(RuntimeError::RegistryUnreachable(err.clone()));
            }
        }

        let detail = self.inspect_image_digest(image_ref).await?;
        Ok(detail)
    }

    async fn inspect_image_digest(&self, image_ref: &str) -> Result<String, RuntimeError> {
        let info = self
            .client
            .inspect_image(image_ref)
            .await
            .map_err(|e| RuntimeError::Other(e.to_string()))?;

        info.repo_digests
            .unwrap_or_default()
            .into_iter()
            .find_map(|d| d.split('@').nth(1).map(|s| s.to_string()))
            .or(info.id)
            .ok_or_else(|| RuntimeError::Other("image has no digest after pull".into()))
    }

    fn classify_pull_error(e: bollard::errors::Error) -> RuntimeError {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 401, .. }
            | bollard::errors::Error::DockerResponseServerError { status_code: 403, .. } => RuntimeError::AuthRequired,
            _ => RuntimeError::RegistryUnreachable(e.to_string()),
        }
    }
}

fn status_enum_str(status: bollard::models::ContainerStateStatusEnum) -> &'static str {
    use bollard::models::ContainerStateStatusEnum::*;
    match status {
        CREATED => "created",
        RUNNING => "running",
        PAUSED => "paused",
        RESTARTING => "restarting",
        EXITED => "exited",
        REMOVING => "removing",
        DEAD => "dead",
        EMPTY | _ => "unknown",
    }
}
