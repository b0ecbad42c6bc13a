use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, Table};
use lab_orchestration::{
    AgentConfig, EnvironmentStatus, ExerciseStatus, RegistrySnapshot, StateBackend, open_store,
};
use std::path::PathBuf;
use tracing::debug;

pub async fn show(state_path: Option<PathBuf>, backend: StateBackend, format: &str) -> Result<()> {
    // Same default location the agent uses
    let path = state_path.unwrap_or_else(|| AgentConfig::new("localhost").state_path());
    debug!("Opening {} store at {}", backend, path.display());

    let store = open_store(backend, &path)
        .await
        .with_context(|| format!("Failed to open state store at {}", path.display()))?;
    let Some(snapshot) = store.load().await.context("Failed to load snapshot")? else {
        println!("No snapshot found at {}", path.display());
        return Ok(());
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "table" => {
            println!(
                "Snapshot v{} saved {}",
                snapshot.version,
                snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("{}", snapshot_table(&snapshot));
        }
        other => bail!("Unknown format '{}', expected 'table' or 'json'", other),
    }

    Ok(())
}

fn snapshot_table(snapshot: &RegistrySnapshot) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Event", "Status", "VPN", "Lab", "Type", "Subnet", "Exercises",
    ]);

    for env in &snapshot.environments {
        let status = Cell::new(env.status).fg(status_color(env.status));

        if env.labs.is_empty() {
            table.add_row(vec![
                Cell::new(&env.config.tag),
                status,
                Cell::new(env.config.vpn_address),
                Cell::new("-"),
                Cell::new(env.config.lab_type),
                Cell::new("-"),
                Cell::new("-"),
            ]);
            continue;
        }

        for lab in &env.labs {
            let exercises = lab
                .exercises
                .iter()
                .map(|e| format!("{} ({})", e.tag(), exercise_label(e.status())))
                .collect::<Vec<_>>()
                .join(", ");
            let lab_cell = if lab.is_vpn {
                format!("{} (vpn)", lab.tag)
            } else {
                lab.tag.clone()
            };

            table.add_row(vec![
                Cell::new(&env.config.tag),
                status.clone(),
                Cell::new(env.config.vpn_address),
                Cell::new(lab_cell),
                Cell::new(lab.lab_type),
                Cell::new(lab.handle.subnet),
                Cell::new(exercises),
            ]);
        }
    }

    table
}

fn status_color(status: EnvironmentStatus) -> Color {
    match status {
        EnvironmentStatus::Initializing => Color::Yellow,
        EnvironmentStatus::Running => Color::Green,
        EnvironmentStatus::Closing => Color::Magenta,
        EnvironmentStatus::Closed => Color::Red,
    }
}

fn exercise_label(status: ExerciseStatus) -> &'static str {
    match status {
        ExerciseStatus::Static => "static",
        ExerciseStatus::Created => "created",
        ExerciseStatus::Running => "running",
        ExerciseStatus::Stopped => "stopped",
        ExerciseStatus::Failed => "failed",
    }
}
