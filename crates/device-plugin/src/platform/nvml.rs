//! NVML implementation of the device backend.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::EventSet;
use nvml_wrapper::Nvml;
use tracing::info;
use tracing::warn;

use crate::domain::backend::BackendError;
use crate::domain::backend::CriticalEvent;
use crate::domain::backend::DeviceBackend;
use crate::domain::backend::EventSource;
use crate::domain::backend::PhysicalDevice;

const MIB: u64 = 1024 * 1024;

/// Code NVML uses for an XID it could not read. Never benign.
pub const UNKNOWN_XID: u64 = 999;

/// XID carried by a critical event; unreadable codes count as critical.
fn xid_code(data: Option<XidError>) -> u64 {
    match data {
        Some(XidError::Value(xid)) => xid,
        Some(XidError::Unknown) | None => UNKNOWN_XID,
    }
}

fn query_error(message: impl Into<String>) -> BackendError {
    BackendError::Query {
        message: message.into(),
    }
}

pub struct NvmlBackend {
    nvml: Nvml,
}

impl NvmlBackend {
    /// Loads NVML, retrying with the versioned library name when the
    /// default lookup fails.
    pub fn init() -> Result<Self, Report<BackendError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                info!("NVML initialized successfully");
                nvml
            }
            Err(e) => {
                warn!("standard NVML init failed ({e}), trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context_lazy(|| BackendError::Unavailable {
                        message: "failed to load NVML".to_string(),
                    })?;
                info!("NVML initialized with explicit library path");
                nvml
            }
        };

        Ok(Self { nvml })
    }
}

impl DeviceBackend for NvmlBackend {
    fn devices(&self) -> Result<Vec<PhysicalDevice>, Report<BackendError>> {
        let count = self
            .nvml
            .device_count()
            .change_context_lazy(|| query_error("device count"))?;
        info!("discovered {count} GPU device(s)");

        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            let device = self
                .nvml
                .device_by_index(i)
                .change_context_lazy(|| query_error(format!("device {i}")))?;
            let uuid = device
                .uuid()
                .change_context_lazy(|| query_error(format!("uuid of device {i}")))?;
            let memory = device
                .memory_info()
                .change_context_lazy(|| query_error(format!("memory of {uuid}")))?;
            let index = device
                .minor_number()
                .change_context_lazy(|| query_error(format!("minor number of {uuid}")))?;
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());

            let memory_mib = memory.total / MIB;
            info!(%uuid, %name, index, memory_mib, "found GPU /dev/nvidia{index}");
            devices.push(PhysicalDevice {
                uuid,
                memory_mib,
                index,
            });
        }

        Ok(devices)
    }

    fn event_source(&self) -> Result<Box<dyn EventSource + '_>, Report<BackendError>> {
        let set = self
            .nvml
            .create_event_set()
            .change_context_lazy(|| query_error("create event set"))?;
        Ok(Box::new(NvmlEventSource {
            nvml: &self.nvml,
            set: Some(set),
            registered: Vec::new(),
        }))
    }
}

/// Critical XID subscription over one NVML event set.
struct NvmlEventSource<'nvml> {
    nvml: &'nvml Nvml,
    set: Option<EventSet<'nvml>>,
    registered: Vec<String>,
}

impl<'nvml> NvmlEventSource<'nvml> {
    fn register_into(
        &self,
        uuid: &str,
        set: EventSet<'nvml>,
    ) -> Result<EventSet<'nvml>, NvmlError> {
        let device = self.nvml.device_by_uuid(uuid)?;
        device
            .register_events(EventTypes::CRITICAL_XID_ERROR, set)
            .map_err(|e| e.error)
    }

    /// NVML releases the set when a registration fails, so rebuild it from
    /// the devices registered so far.
    fn rebuild(&mut self) {
        let mut set = match self.nvml.create_event_set() {
            Ok(set) => set,
            Err(e) => {
                warn!("failed to recreate event set: {e}");
                return;
            }
        };
        for uuid in &self.registered {
            match self.register_into(uuid, set) {
                Ok(next) => set = next,
                Err(e) => {
                    warn!("failed to re-register events for {uuid}: {e}");
                    return;
                }
            }
        }
        self.set = Some(set);
    }
}

impl EventSource for NvmlEventSource<'_> {
    fn register(&mut self, uuid: &str) -> Result<(), Report<BackendError>> {
        let set = match self.set.take() {
            Some(set) => set,
            None => self
                .nvml
                .create_event_set()
                .change_context_lazy(|| query_error("create event set"))?,
        };

        match self.register_into(uuid, set) {
            Ok(set) => {
                self.set = Some(set);
                self.registered.push(uuid.to_string());
                Ok(())
            }
            Err(e) => {
                self.rebuild();
                let context = match e {
                    NvmlError::NotSupported => BackendError::NotSupported {
                        uuid: uuid.to_string(),
                    },
                    _ => query_error(format!("register events for {uuid}")),
                };
                Err(Report::new(e).change_context(context))
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<CriticalEvent>, Report<BackendError>> {
        let Some(set) = &self.set else {
            std::thread::sleep(timeout);
            return Ok(None);
        };

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match set.wait(timeout_ms) {
            Ok(data) => {
                if !data.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                    return Ok(None);
                }
                Ok(Some(CriticalEvent {
                    uuid: data.device.uuid().ok(),
                    xid: xid_code(data.event_data),
                }))
            }
            Err(NvmlError::Timeout) => Ok(None),
            Err(e) => Err(Report::new(e).change_context(query_error("wait for event"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::health::BENIGN_XIDS;

    #[test]
    fn xid_values_are_passed_through() {
        assert_eq!(xid_code(Some(XidError::Value(79))), 79);
        assert_eq!(xid_code(Some(XidError::Value(31))), 31);
    }

    #[test]
    fn unreadable_xid_is_treated_as_critical() {
        assert_eq!(xid_code(Some(XidError::Unknown)), UNKNOWN_XID);
        assert_eq!(xid_code(None), UNKNOWN_XID);
        assert!(!BENIGN_XIDS.contains(&UNKNOWN_XID));
    }
}
