//! Tracing setup for the server binary.
//!
//! Diagnostics go to stderr only; stdout belongs to the protocol stream and
//! must never carry anything but frames.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "CHANTIER_LOG";

pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
