use crate::supervisor::Mode;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "CRON_RUNNER_LOG";

// Interactive runs log to stderr. Unattended runs append plain text to the
// shared supervisor log, falling back to stderr if it cannot be opened.
pub fn init(mode: Mode, log_path: &Path) {
    let filter = || EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    if !mode.is_interactive() {
        let opened = log_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(log_path));
        if let Ok(file) = opened {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false);
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(file_layer)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
