//! Kubelet device plugin protocol.

pub mod constants;
pub mod device_plugin;
pub mod types;

pub use device_plugin::api;
pub use device_plugin::DevicePluginService;
pub use device_plugin::SharedGpuPlugin;
pub use types::PluginError;
