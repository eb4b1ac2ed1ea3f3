pub mod cli;
pub mod daemon;
pub mod memory;

use std::path::PathBuf;
use std::time::Duration;

pub use cli::*;
pub use daemon::*;
pub use memory::*;

use crate::platform::k8s::constants;

/// Immutable plugin configuration, built once from the daemon arguments and
/// threaded into every plugin instance.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub enable_mps: bool,
    pub health_check: bool,
    pub memory_unit: MemoryUnit,
    /// Directory holding the kubelet and plugin sockets.
    pub device_plugin_path: PathBuf,
    pub socket_name: String,
    pub resource_name: String,
    pub dump_dir: PathBuf,
    pub restart_interval: Duration,
}

impl PluginConfig {
    /// Full path of this plugin's gRPC socket.
    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_path.join(&self.socket_name)
    }

    /// Full path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_path.join(constants::KUBELET_SOCKET)
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_mps: false,
            health_check: false,
            memory_unit: MemoryUnit::MiB,
            device_plugin_path: PathBuf::from(constants::DEVICE_PLUGIN_PATH),
            socket_name: constants::SERVER_SOCK.to_string(),
            resource_name: constants::RESOURCE_NAME.to_string(),
            dump_dir: PathBuf::from(constants::DUMP_DIR),
            restart_interval: Duration::from_secs(5),
        }
    }
}

impl From<&DaemonArgs> for PluginConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            enable_mps: args.mps,
            health_check: args.health_check,
            memory_unit: MemoryUnit::parse_or_default(&args.memory_unit),
            device_plugin_path: args.device_plugin_path.clone(),
            dump_dir: args.dump_dir.clone(),
            restart_interval: Duration::from_secs(args.restart_interval_secs.max(1)),
            ..Self::default()
        }
    }
}
