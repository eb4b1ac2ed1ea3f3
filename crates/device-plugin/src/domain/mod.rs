//! Device virtualization, health monitoring and plugin supervision.

pub mod backend;
pub mod health;
pub mod mock;
pub mod supervisor;
pub mod virtual_device;

pub use backend::DeviceBackend;
pub use backend::PhysicalDevice;
pub use health::HealthMonitor;
pub use health::UnhealthyDevices;
pub use virtual_device::DeviceVirtualizer;
pub use virtual_device::VirtualDeviceSet;
