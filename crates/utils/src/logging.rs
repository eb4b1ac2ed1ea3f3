//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Boxed layer type shared by the binaries of this workspace.
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Default env filter: INFO unless overridden by `RUST_LOG`.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Human readable layer writing to stderr.
pub fn get_fmt_layer<S>() -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

/// Daily rolling file layer, the returned guard must outlive the subscriber.
pub fn get_file_layer<S>(
    dir: &Path,
    file_name: &str,
) -> Result<(BoxedLayer<S>, WorkerGuard), tracing_appender::rolling::InitError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(7)
        .build(dir)?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();

    Ok((file_layer, file_guard))
}
