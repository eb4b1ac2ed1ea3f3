//! Boundary to the hardware access layer.

use std::time::Duration;

use error_stack::Report;
use thiserror::Error;

/// A physical GPU as enumerated by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Globally unique identity, e.g. `GPU-8c1d...`.
    pub uuid: String,
    /// Total framebuffer memory in MiB.
    pub memory_mib: u64,
    /// Device minor number, `N` in `/dev/nvidiaN`.
    pub index: u32,
}

/// A critical hardware error reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalEvent {
    /// Device the event belongs to, `None` when the backend could not tell.
    pub uuid: Option<String>,
    /// XID error code.
    pub xid: u64,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device backend is unavailable: {message}")]
    Unavailable { message: String },
    #[error("device {uuid} does not support event monitoring")]
    NotSupported { uuid: String },
    #[error("device backend query failed: {message}")]
    Query { message: String },
}

/// Hardware access layer: enumeration and event subscription.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Enumerates every physical device, in backend order.
    fn devices(&self) -> Result<Vec<PhysicalDevice>, Report<BackendError>>;

    /// Opens a fresh source of critical events. Sources are driven from a
    /// single blocking thread and are not shared.
    fn event_source(&self) -> Result<Box<dyn EventSource + '_>, Report<BackendError>>;
}

/// Subscription to critical hardware events.
pub trait EventSource {
    /// Subscribes to critical events of one device. Devices that cannot be
    /// monitored fail with [`BackendError::NotSupported`].
    fn register(&mut self, uuid: &str) -> Result<(), Report<BackendError>>;

    /// Waits up to `timeout` for the next event, `Ok(None)` on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<Option<CriticalEvent>, Report<BackendError>>;
}
