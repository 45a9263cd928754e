mod demo;

use clap::{Parser, Subcommand};
use conductor_core::{AgentRole, Phase};
use conductor_orchestrator::ConductorConfig;
use conductor_state::{backend_for, StateStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor — phased multi-agent coordination engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulated iteration through every phase
    Demo {
        /// Simulated work time per task, in milliseconds
        #[arg(long, default_value_t = 40)]
        task_ms: u64,
    },
    /// Print the phase table
    Phases,
    /// Print the persisted system state
    State,
    /// List snapshots, newest first
    Snapshots {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Replace the persisted state with a snapshot
    Restore {
        /// Snapshot id
        id: Uuid,
    },
}

async fn open_store(config: &ConductorConfig) -> anyhow::Result<StateStore> {
    if config.state.data_dir.is_none() {
        warn!("No state.data_dir configured, state lives in memory only");
    }
    let backend = backend_for(&config.state).await?;
    Ok(StateStore::open(backend, config.state.clone()).await?)
}

fn print_phases() {
    for phase in Phase::ALL {
        let definition = phase.definition();
        let roles: Vec<&str> = definition.active_roles.iter().map(AgentRole::as_str).collect();
        println!("{phase}");
        println!("  roles:        {}", roles.join(", "));
        println!("  exit:         {}", definition.exit_criteria.join(", "));
        println!("  deliverables: {}", definition.deliverables.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = ConductorConfig::load(&cli.config)?;

    match cli.command {
        Commands::Demo { task_ms } => {
            info!(config = %cli.config.display(), "Starting demo run");
            let summary = demo::run(config, Duration::from_millis(task_ms)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Phases => print_phases(),
        Commands::State => {
            let store = open_store(&config).await?;
            let state = store.get_system_state().await;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Snapshots { limit } => {
            let store = open_store(&config).await?;
            let history = store.get_history(limit).await;
            if history.is_empty() {
                println!("No snapshots.");
            }
            for snapshot in history {
                println!(
                    "{}  {}  {:<9}  {}",
                    snapshot.id,
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.state.phase.as_str(),
                    snapshot.reason
                );
            }
        }
        Commands::Restore { id } => {
            let store = open_store(&config).await?;
            store.restore_snapshot(id).await?;
            store.save().await?;
            let phase = store.phase().await;
            info!(snapshot_id = %id, phase = %phase, "Snapshot restored");
            println!("Restored snapshot {id} (phase {phase})");
        }
    }

    Ok(())
}
