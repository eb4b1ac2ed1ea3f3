//! Test adapter implementing [`DeviceBackend`] with scripted devices and events.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;

use crate::domain::backend::BackendError;
use crate::domain::backend::CriticalEvent;
use crate::domain::backend::DeviceBackend;
use crate::domain::backend::EventSource;
use crate::domain::backend::PhysicalDevice;

/// In-memory backend. Events are shared by every source it hands out and
/// consumed once.
#[derive(Default, Clone)]
pub struct MockBackend {
    devices: Vec<PhysicalDevice>,
    unsupported: HashSet<String>,
    events: Arc<Mutex<VecDeque<CriticalEvent>>>,
    registered: Arc<Mutex<Vec<String>>>,
    enumeration_error: Arc<Mutex<bool>>,
    wait_errors: Arc<AtomicUsize>,
    open_sources: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn with_devices(mut self, devices: impl IntoIterator<Item = PhysicalDevice>) -> Self {
        self.devices.extend(devices);
        self
    }

    pub fn with_unsupported(mut self, uuid: &str) -> Self {
        self.unsupported.insert(uuid.to_string());
        self
    }

    pub fn with_events(self, events: impl IntoIterator<Item = CriticalEvent>) -> Self {
        self.push_events(events);
        self
    }

    /// Queues events for delivery by any open source.
    pub fn push_events(&self, events: impl IntoIterator<Item = CriticalEvent>) {
        self.events.lock().expect("poisoned").extend(events);
    }

    /// Makes the next `count` waits fail before any queued event is delivered.
    pub fn with_wait_errors(self, count: usize) -> Self {
        self.wait_errors.store(count, Ordering::SeqCst);
        self
    }

    /// Event sources handed out and not yet dropped.
    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }

    /// Makes the next enumerations fail.
    pub fn set_enumeration_error(&self, enabled: bool) {
        *self.enumeration_error.lock().expect("poisoned") = enabled;
    }

    /// Uuids registered for events, in registration order.
    pub fn registered(&self) -> Arc<Mutex<Vec<String>>> {
        self.registered.clone()
    }
}

impl DeviceBackend for MockBackend {
    fn devices(&self) -> Result<Vec<PhysicalDevice>, Report<BackendError>> {
        if *self.enumeration_error.lock().expect("poisoned") {
            return Err(Report::new(BackendError::Query {
                message: "mock enumeration failure".to_string(),
            }));
        }
        Ok(self.devices.clone())
    }

    fn event_source(&self) -> Result<Box<dyn EventSource + '_>, Report<BackendError>> {
        self.open_sources.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEventSource { backend: self }))
    }
}

struct MockEventSource<'a> {
    backend: &'a MockBackend,
}

impl EventSource for MockEventSource<'_> {
    fn register(&mut self, uuid: &str) -> Result<(), Report<BackendError>> {
        if self.backend.unsupported.contains(uuid) {
            return Err(Report::new(BackendError::NotSupported {
                uuid: uuid.to_string(),
            }));
        }
        self.backend
            .registered
            .lock()
            .expect("poisoned")
            .push(uuid.to_string());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<CriticalEvent>, Report<BackendError>> {
        let failing = self
            .backend
            .wait_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Report::new(BackendError::Query {
                message: "mock wait failure".to_string(),
            }));
        }

        let next = self.backend.events.lock().expect("poisoned").pop_front();
        if next.is_none() {
            std::thread::sleep(timeout);
        }
        Ok(next)
    }
}

impl Drop for MockEventSource<'_> {
    fn drop(&mut self) {
        self.backend.open_sources.fetch_sub(1, Ordering::SeqCst);
    }
}
