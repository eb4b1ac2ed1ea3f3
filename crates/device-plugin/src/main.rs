use anyhow::Result;
use clap::Parser;
use gpushare_device_plugin::app;
use gpushare_device_plugin::config::Cli;
use gpushare_device_plugin::config::PluginConfig;
use gpushare_device_plugin::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(&cli.daemon.log_dir);

    let config = PluginConfig::from(&cli.daemon);
    app::run(config).await
}
