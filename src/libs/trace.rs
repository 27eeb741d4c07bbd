//! Sets up tracing for the autoscaler on stdout/stderr

use tracing_subscriber::prelude::*;

use super::conf::LogLevel;

/// Setup our local tracer
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `level` - The log level to set
pub fn setup(name: &str, level: LogLevel) {
    // build our local tracing layer
    let local = tracing_subscriber::fmt::layer().with_filter(level.to_filter());
    // init our tracing registry
    tracing_subscriber::registry()
        .with(local)
        .try_init()
        .expect("Failed to register stdout registry");
    tracing::info!(service = name, level = ?level, "tracing initialized");
}
