//! Wires the NVML backend, the watchers and the supervisor together.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use utils::version;

use crate::config::PluginConfig;
use crate::domain::backend::DeviceBackend;
use crate::domain::supervisor::ManagedPlugin;
use crate::domain::supervisor::PluginLauncher;
use crate::domain::supervisor::Supervisor;
use crate::domain::virtual_device::DeviceVirtualizer;
use crate::platform::k8s::constants;
use crate::platform::k8s::PluginError;
use crate::platform::k8s::SharedGpuPlugin;
use crate::platform::nvml::NvmlBackend;
use crate::platform::watchers;

const EVENT_BUFFER: usize = 16;

/// Builds a fresh [`SharedGpuPlugin`] from the current device enumeration.
pub struct NvidiaLauncher {
    config: Arc<PluginConfig>,
    backend: Arc<dyn DeviceBackend>,
}

impl NvidiaLauncher {
    pub fn new(config: Arc<PluginConfig>, backend: Arc<dyn DeviceBackend>) -> Self {
        Self { config, backend }
    }
}

#[async_trait]
impl PluginLauncher for NvidiaLauncher {
    type Plugin = SharedGpuPlugin;

    async fn launch(&mut self) -> Result<SharedGpuPlugin, Report<PluginError>> {
        let physical = self
            .backend
            .devices()
            .change_context(PluginError::Enumeration)?;
        let devices = DeviceVirtualizer::new(self.config.memory_unit).slice(&physical);

        let mut plugin = SharedGpuPlugin::new(self.config.clone(), self.backend.clone(), devices);
        plugin.serve().await?;
        Ok(plugin)
    }
}

#[async_trait]
impl ManagedPlugin for SharedGpuPlugin {
    async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        SharedGpuPlugin::stop(self).await
    }

    fn status(&self) -> String {
        let devices = self.devices();
        let set = devices.borrow();
        format!(
            "socket={} serving={} devices={} healthy={} gpu_memory={}{}",
            self.socket().display(),
            self.is_serving(),
            set.len(),
            set.healthy_count(),
            set.gpu_memory(),
            set.memory_unit(),
        )
    }
}

/// Runs the daemon against the real GPUs.
pub async fn run(config: PluginConfig) -> Result<()> {
    info!(
        mps = config.enable_mps,
        health_check = config.health_check,
        memory_unit = %config.memory_unit,
        "starting gpushare device plugin {}",
        &**version::VERSION
    );
    info!(
        "serving {}, declaring {}",
        config.resource_name,
        constants::RESOURCE_COUNT
    );

    let backend: Arc<dyn DeviceBackend> = match NvmlBackend::init() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!("failed to initialize NVML: {e:?}");
            error!("if this is a GPU node, did you set the docker default runtime to `nvidia`?");
            wait_forever().await;
            return Ok(());
        }
    };

    run_with_backend(Arc::new(config), backend).await
}

/// Runs the supervisor until a termination signal or a fatal enumeration
/// failure. Blocks forever when there is no GPU to share.
pub async fn run_with_backend(
    config: Arc<PluginConfig>,
    backend: Arc<dyn DeviceBackend>,
) -> Result<()> {
    match backend.devices() {
        Ok(devices) if devices.is_empty() => {
            info!("no devices found, waiting indefinitely");
            wait_forever().await;
        }
        Err(e) => {
            error!("failed to enumerate devices: {e:?}, waiting indefinitely");
            wait_forever().await;
        }
        Ok(_) => {}
    }

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let _fs_watcher = watchers::watch_kubelet_socket(
        &config.device_plugin_path,
        config.kubelet_socket(),
        tx.clone(),
    )
    .map_err(|e| anyhow!("failed to create filesystem watcher: {e:?}"))?;
    let signals =
        watchers::spawn_signal_watcher(tx).context("failed to install signal handlers")?;

    let supervisor = Supervisor::new(
        NvidiaLauncher::new(config.clone(), backend),
        config.restart_interval,
        config.dump_dir.clone(),
    );
    let result = supervisor.run(rx).await;
    signals.abort();

    result.map_err(|e| anyhow!("{e:?}"))?;
    info!("gpushare device plugin stopped");
    Ok(())
}

async fn wait_forever() {
    std::future::pending::<()>().await;
}
