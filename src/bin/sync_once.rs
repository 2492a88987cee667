//! One reconciliation run against the configured database.
//!
//! Prints the outcome as JSON on stdout. Exit status: 0 on success,
//! 2 on a partial run, 1 when the run failed outright.

use std::process::ExitCode;

use renewalsync_lib::db::SyncStatus;
use renewalsync_lib::state::{load_config, open_database};
use renewalsync_lib::workflow::reconcile::{reconcile, ReconcileOptions};

fn main() -> anyhow::Result<ExitCode> {
    let (config, config_source) = load_config().map_err(anyhow::Error::msg)?;
    renewalsync_lib::init_logging(config.log_format);
    config_source.log();

    let db = open_database(&config).map_err(anyhow::Error::msg)?;
    let outcome = reconcile(&db, &ReconcileOptions::from(&config.sync));

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(match outcome.status {
        SyncStatus::Success => ExitCode::SUCCESS,
        SyncStatus::Partial => ExitCode::from(2),
        SyncStatus::Failed => ExitCode::FAILURE,
    })
}
