//! Tracing setup for the daemon.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Registry;
use utils::logging::BoxedLayer;

const LOG_FILE: &str = "gpushare.log";

/// Installs the global subscriber: stderr, plus a daily rolling file in
/// `log_dir` when it can be opened. The guard flushes the file writer and
/// must be held for the lifetime of the process.
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer<Registry>> = vec![utils::logging::get_fmt_layer::<Registry>()
        .with_filter(utils::logging::env_filter())
        .boxed()];

    let mut file_error = None;
    let guard = match utils::logging::get_file_layer::<Registry>(log_dir, LOG_FILE) {
        Ok((layer, guard)) => {
            layers.push(layer.with_filter(utils::logging::env_filter()).boxed());
            Some(guard)
        }
        Err(e) => {
            file_error = Some(format!("{}: {e}", log_dir.display()));
            None
        }
    };

    registry().with(layers).init();

    if let Some(e) = file_error {
        tracing::warn!("file logging disabled, failed to open log directory {e}");
    }
    guard
}
