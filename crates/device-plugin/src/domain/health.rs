//! Critical XID event monitoring.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::backend::BackendError;
use crate::domain::backend::CriticalEvent;
use crate::domain::backend::DeviceBackend;

/// Application level XIDs that leave the GPU itself healthy.
/// See https://docs.nvidia.com/deploy/xid-errors/index.html
pub const BENIGN_XIDS: [u64; 3] = [31, 43, 45];

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Devices whose virtual slices must be reported unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyDevices {
    /// Every slice of every physical device.
    All,
    /// Every slice of one physical device.
    Physical(String),
}

pub struct HealthMonitor {
    backend: Arc<dyn DeviceBackend>,
    physical_ids: Vec<String>,
    poll_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(backend: Arc<dyn DeviceBackend>, physical_ids: Vec<String>) -> Self {
        Self {
            backend,
            physical_ids,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Runs the monitor on a blocking thread until `cancellation_token` fires
    /// or the receiving side goes away.
    pub fn spawn(
        self,
        unhealthy: mpsc::Sender<UnhealthyDevices>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = self.run(&unhealthy, &cancellation_token) {
                error!("health monitor stopped: {e:?}");
            }
        })
    }

    /// Maps an event to the devices it affects, `None` if it is ignored.
    pub fn classify(&self, event: &CriticalEvent) -> Option<UnhealthyDevices> {
        if BENIGN_XIDS.contains(&event.xid) {
            return None;
        }

        match event.uuid.as_deref() {
            None | Some("") => Some(UnhealthyDevices::All),
            Some(uuid) => self
                .physical_ids
                .iter()
                .find(|id| id.as_str() == uuid)
                .map(|id| UnhealthyDevices::Physical(id.clone())),
        }
    }

    #[tracing::instrument(skip_all, fields(devices = self.physical_ids.len()))]
    fn run(
        &self,
        unhealthy: &mpsc::Sender<UnhealthyDevices>,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<BackendError>> {
        let mut source = self.backend.event_source()?;

        for uuid in &self.physical_ids {
            match source.register(uuid) {
                Ok(()) => info!("registered critical events for device {uuid}"),
                Err(e) if matches!(e.current_context(), BackendError::NotSupported { .. }) => {
                    warn!("{uuid} is too old to support health checking: {e}, marking unhealthy");
                    if unhealthy
                        .blocking_send(UnhealthyDevices::Physical(uuid.clone()))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(e) => error!("failed to register critical events for device {uuid}: {e:?}"),
            }
        }

        while !cancellation_token.is_cancelled() {
            let event = match source.wait(self.poll_timeout) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    debug!("waiting for critical event failed: {e:?}");
                    std::thread::sleep(WAIT_ERROR_BACKOFF);
                    continue;
                }
            };

            let Some(target) = self.classify(&event) else {
                debug!(xid = event.xid, uuid = ?event.uuid, "ignoring event");
                continue;
            };

            warn!(
                xid = event.xid,
                uuid = ?event.uuid,
                "critical xid error, marking {target:?} unhealthy"
            );
            if unhealthy.blocking_send(target).is_err() {
                break;
            }
        }

        info!("health monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::mock::MockBackend;

    fn monitor(backend: MockBackend, ids: &[&str]) -> HealthMonitor {
        HealthMonitor::new(
            Arc::new(backend),
            ids.iter().map(|id| id.to_string()).collect(),
        )
        .with_poll_timeout(Duration::from_millis(10))
    }

    fn event(uuid: Option<&str>, xid: u64) -> CriticalEvent {
        CriticalEvent {
            uuid: uuid.map(str::to_string),
            xid,
        }
    }

    #[test]
    fn classify_ignores_benign_xids() {
        let monitor = monitor(MockBackend::default(), &["GPU-1"]);
        for xid in BENIGN_XIDS {
            assert_eq!(monitor.classify(&event(Some("GPU-1"), xid)), None);
            assert_eq!(monitor.classify(&event(None, xid)), None);
        }
    }

    #[test]
    fn classify_event_without_device_targets_all() {
        let monitor = monitor(MockBackend::default(), &["GPU-1", "GPU-2"]);
        assert_eq!(monitor.classify(&event(None, 79)), Some(UnhealthyDevices::All));
        assert_eq!(monitor.classify(&event(Some(""), 48)), Some(UnhealthyDevices::All));
    }

    #[test]
    fn classify_event_targets_matching_device_only() {
        let monitor = monitor(MockBackend::default(), &["GPU-1", "GPU-2"]);
        assert_eq!(
            monitor.classify(&event(Some("GPU-2"), 48)),
            Some(UnhealthyDevices::Physical("GPU-2".to_string()))
        );
        assert_eq!(monitor.classify(&event(Some("GPU-9"), 48)), None);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn unsupported_devices_are_reported_immediately() {
        let backend = MockBackend::default().with_unsupported("GPU-2");
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let handle = monitor(backend, &["GPU-1", "GPU-2"]).spawn(tx, token.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first, UnhealthyDevices::Physical("GPU-2".to_string()));

        token.cancel();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn events_are_forwarded_in_order_until_cancelled() {
        let backend = MockBackend::default().with_events([
            event(Some("GPU-1"), 31),
            event(Some("GPU-1"), 79),
            event(None, 48),
        ]);
        let registered = backend.registered();
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let handle = monitor(backend, &["GPU-1", "GPU-2"]).spawn(tx, token.clone());

        assert_eq!(
            rx.recv().await.unwrap(),
            UnhealthyDevices::Physical("GPU-1".to_string())
        );
        assert_eq!(rx.recv().await.unwrap(), UnhealthyDevices::All);

        token.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            registered.lock().unwrap().clone(),
            vec!["GPU-1".to_string(), "GPU-2".to_string()]
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn wait_errors_are_absorbed() {
        let backend = MockBackend::default()
            .with_wait_errors(1)
            .with_events([event(None, 79)]);
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let handle = monitor(backend.clone(), &["GPU-1"]).spawn(tx, token.clone());

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(UnhealthyDevices::All));

        token.cancel();
        handle.await.unwrap();
        assert_eq!(backend.open_sources(), 0);
    }
}
