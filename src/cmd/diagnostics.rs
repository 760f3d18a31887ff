//! Diagnostics command: verifies the configuration parses and the
//! container runtime is reachable, then exits without starting the
//! monitor loop or Control Surface (spec §6 exit codes: 1 config error,
//! 2 runtime init failure).

use fleetwatch_daemon::config::AgentConfiguration;
use fleetwatch_daemon::runtime::{DockerRuntime, RuntimeAdapter};

pub async fn run(config_path: &str) {
    println!("Agent Diagnostics");
    println!("==================\n");

    println!("Configuration:");
    let config = match AgentConfiguration::load(config_path) {
        Ok(config) => {
            println!("  OK: loaded from {config_path}");
            println!("  check_interval: {}s", config.check_interval_secs);
            println!("  update_interval: {}s", config.update_interval_secs);
            println!("  runtime_endpoint: {}", config.runtime_endpoint);
            println!("  max_parallel_updates: {}", config.max_parallel_updates);
            config
        }
        Err(e) => {
            println!("  FAILED: {e}");
            std::process::exit(1);
        }
    };

    println!("\nContainer runtime:");
    let runtime = match DockerRuntime::connect(&config.runtime_endpoint) {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("  FAILED: {e}");
            std::process::exit(2);
        }
    };

    match runtime.list().await {
        Ok(outcome) => {
            println!("  OK: reachable at {}", config.runtime_endpoint);
            println!("  containers: {}", outcome.summaries.len());
        }
        Err(e) => {
            println!("  FAILED: {e}");
            std::process::exit(2);
        }
    }

    println!("\nDiagnostics complete.");
}
