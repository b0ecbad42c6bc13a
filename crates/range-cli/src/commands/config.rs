use anyhow::{Context, Result};
use lab_orchestration::AgentConfig;
use std::path::Path;

pub fn check(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    let config = AgentConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let pool = config.vpn_pool().context("Invalid VPN range")?;

    println!("✓ Configuration valid");
    for (key, value) in effective_values(&config) {
        println!("  {}: {}", key, value);
    }
    println!("  environments per agent: {}", pool.capacity());

    Ok(())
}

/// Effective settings with defaults applied, in file order
fn effective_values(config: &AgentConfig) -> Vec<(&'static str, String)> {
    vec![
        ("host", config.host.clone()),
        ("vpn_range", config.vpn_range().to_string()),
        ("vpn_subnet_prefix", format!("/{}", config.vpn_subnet_prefix)),
        ("state_path", config.state_path().display().to_string()),
        ("state_backend", config.state_backend.to_string()),
        (
            "workers_per_environment",
            config.workers_per_environment.to_string(),
        ),
        ("teardown_workers", config.teardown_workers.to_string()),
        ("task_queue_capacity", config.task_queue_capacity.to_string()),
        ("lab_stream_capacity", config.lab_stream_capacity.to_string()),
        ("default_vpn_port", config.default_vpn_port.to_string()),
        ("default_team_size", config.default_team_size.to_string()),
    ]
}
