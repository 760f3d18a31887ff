//! Main daemon command: wires the Event Bus, Registry, Runtime Adapter,
//! Update Engine, Monitor Loop, and Control Surface together, then serves
//! until a shutdown signal arrives (spec §4, §6).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetwatch_daemon::config::AgentConfiguration;
use fleetwatch_daemon::events::EventBus;
use fleetwatch_daemon::monitor::MonitorLoop;
use fleetwatch_daemon::registry::Registry;
use fleetwatch_daemon::router::{self, AppState};
use fleetwatch_daemon::runtime::{DockerRuntime, RuntimeAdapter};
use fleetwatch_daemon::updater::UpdateEngine;

/// Run the agent. `config_path` is the TOML file `AgentConfiguration`
/// loads from; a missing file falls back to defaults plus env overrides.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from {config_path}");
    let config = AgentConfiguration::load(config_path)?;
    info!(
        check_interval = config.check_interval_secs,
        update_interval = config.update_interval_secs,
        runtime_endpoint = %config.runtime_endpoint,
        "configuration loaded"
    );

    let events = EventBus::new(config.event_buffer_size);
    let registry = Arc::new(Registry::new(events.clone()));

    let runtime: Arc<dyn RuntimeAdapter> = Arc::new(
        DockerRuntime::connect(&config.runtime_endpoint)
            .map_err(|e| anyhow::anyhow!("failed to connect to container runtime: {e}"))?,
    );

    let shared_config = Arc::new(RwLock::new(config.clone()));

    let updater = UpdateEngine::new(
        registry.clone(),
        events.clone(),
        runtime.clone(),
        shared_config.clone(),
        config.max_parallel_updates,
        config.cleanup,
    );

    let monitor = MonitorLoop::new(registry.clone(), events.clone(), runtime.clone(), shared_config.clone());

    let shutdown_token = CancellationToken::new();

    let monitor_token = shutdown_token.clone();
    let monitor_task = tokio::spawn(monitor.run(monitor_token));

    let sweep_updater = updater.clone();
    let sweep_config = shared_config.clone();
    let sweep_token = shutdown_token.clone();
    let sweep_task = tokio::spawn(async move {
        loop {
            let interval = sweep_config.read().update_interval();
            tokio::select! {
                _ = sweep_token.cancelled() => {
                    debug!("update check sweep stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    sweep_updater.run_check_sweep(interval).await;
                }
            }
        }
    });

    events.emit_agent_started();
    info!("agent started");

    let state = AppState {
        registry: registry.clone(),
        events: events.clone(),
        runtime: runtime.clone(),
        updater: updater.clone(),
        config: shared_config.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let signal_token = shutdown_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {e}");
            return;
        }
        warn!("received shutdown signal, stopping agent");
        signal_token.cancel();
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("control surface listening on {bind_addr}");
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    shutdown_token.cancel();
    let _ = monitor_task.await;
    let _ = sweep_task.await;
    events.emit_agent_stopped();
    info!("agent stopped");
    Ok(())
}
