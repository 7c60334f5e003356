//! Logging configuration
//!
//! Plain tracing-based logging. No OTEL - fixtures live for the duration of a
//! test run.
//!
//! # Example
//!
//! ```no_run
//! use kube_fixtures::telemetry::init_logging;
//!
//! init_logging();
//! ```

use crate::config::FixtureConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";
const TRANSPORT_DIRECTIVES: &str = "info,kube=debug,kube_client=debug,tower_http=debug,hyper_util=debug";

/// Initialize logging with tracing-subscriber
///
/// Uses RUST_LOG env var for filtering (default: info).
/// Safe to call more than once.
pub fn init_logging() {
    install(DEFAULT_DIRECTIVES);
}

/// Initialize logging, turning on transport logging when `config.debug` is set
///
/// RUST_LOG still wins when present.
pub fn init_logging_for(config: &FixtureConfig) {
    install(directives_for(config));
}

fn directives_for(config: &FixtureConfig) -> &'static str {
    if config.debug {
        TRANSPORT_DIRECTIVES
    } else {
        DEFAULT_DIRECTIVES
    }
}

fn install(directives: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
