//! One-shot backlog drain and health report.
//!
//! Opens the registry database (`PATIENT_REGISTRY_DB` or the default data
//! dir), reconciles every unprocessed raw record, and prints the health and
//! matching views as JSON. Scheduling and supervision live outside.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use patient_registry::db::repository::{matching_stats, mobile_app_stats};
use patient_registry::db::sqlite::open_database;
use patient_registry::{drain_backlog, Engine, EngineConfig};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Backlog drain failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = std::env::var_os("PATIENT_REGISTRY_DB")
        .map(PathBuf::from)
        .unwrap_or_else(patient_registry::config::registry_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %db_path.display(), "Opening registry database");

    let config = EngineConfig::default();
    let workers = config.workers;
    let engine = Engine::new(open_database(&db_path)?, config);

    let report = drain_backlog(&engine, workers)?;
    let health = engine.health()?;
    let matching = engine.with_conn(matching_stats)?;
    let mobile = engine.with_conn(mobile_app_stats)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "drain": report,
            "health": health,
            "matching_stats": matching,
            "mobile_app_stats": mobile,
        }))?
    );
    Ok(())
}
