//! Renewal sync: reconciles the source renewals ledger (`zone_original`)
//! into the CRM working table (`zone_working`) and serves the result to
//! account managers over HTTP.

pub mod api;
pub mod db;
pub mod error;
mod migrations;
pub mod services;
pub mod state;
pub mod types;
pub mod workflow;

use tracing_subscriber::EnvFilter;

use types::LogFormat;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,tower_http=info";

/// Install the global subscriber for both `tracing` spans and `log` records.
/// `RUST_LOG` overrides the default filter.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Logging was already initialized: {}", e);
    }
}
