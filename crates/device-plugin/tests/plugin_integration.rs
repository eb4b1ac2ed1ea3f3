use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use gpushare_device_plugin::config::MemoryUnit;
use gpushare_device_plugin::config::PluginConfig;
use gpushare_device_plugin::domain::backend::CriticalEvent;
use gpushare_device_plugin::domain::backend::PhysicalDevice;
use gpushare_device_plugin::domain::mock::MockBackend;
use gpushare_device_plugin::domain::DeviceBackend;
use gpushare_device_plugin::domain::DeviceVirtualizer;
use gpushare_device_plugin::platform::k8s::api;
use gpushare_device_plugin::platform::k8s::api::device_plugin_client::DevicePluginClient;
use gpushare_device_plugin::platform::k8s::api::registration_server::Registration;
use gpushare_device_plugin::platform::k8s::api::registration_server::RegistrationServer;
use gpushare_device_plugin::platform::k8s::device_plugin::dial;
use gpushare_device_plugin::platform::k8s::device_plugin::DIAL_TIMEOUT;
use gpushare_device_plugin::platform::k8s::SharedGpuPlugin;
use similar_asserts::assert_eq;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

/// Kubelet registration endpoint recording every request.
#[derive(Default, Clone)]
struct FakeKubelet {
    requests: Arc<Mutex<Vec<api::RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> Result<Response<api::Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(api::Empty {}))
    }
}

fn serve_fake_kubelet(dir: &Path, kubelet: FakeKubelet) -> CancellationToken {
    let listener = UnixListener::bind(dir.join("kubelet.sock")).unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::UnixListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    });
    token
}

fn gpu(uuid: &str, memory_mib: u64, index: u32) -> PhysicalDevice {
    PhysicalDevice {
        uuid: uuid.to_string(),
        memory_mib,
        index,
    }
}

fn health_summary(response: &api::ListAndWatchResponse) -> Vec<(String, String)> {
    let mut devices: Vec<_> = response
        .devices
        .iter()
        .map(|device| (device.id.clone(), device.health.clone()))
        .collect();
    devices.sort();
    devices
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn plugin_registers_and_serves_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet = FakeKubelet::default();
    let kubelet_stop = serve_fake_kubelet(dir.path(), kubelet.clone());

    let config = Arc::new(PluginConfig {
        device_plugin_path: dir.path().to_path_buf(),
        memory_unit: MemoryUnit::GiB,
        health_check: true,
        ..PluginConfig::default()
    });
    let backend =
        MockBackend::default().with_devices([gpu("GPU-A", 2048, 0), gpu("GPU-B", 2048, 1)]);
    let devices = DeviceVirtualizer::new(config.memory_unit).slice(&backend.devices().unwrap());
    let mut plugin = SharedGpuPlugin::new(config.clone(), Arc::new(backend.clone()), devices);

    plugin.serve().await.unwrap();

    let requests = kubelet.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].version, "v1beta1");
    assert_eq!(requests[0].endpoint, "gpushare.sock");
    assert_eq!(requests[0].resource_name, "shared-gpu/gpu-mem");

    let channel = dial(&config.socket_path(), DIAL_TIMEOUT).await.unwrap();
    let mut client = DevicePluginClient::new(channel);

    let mut stream = client
        .list_and_watch(api::Empty {})
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(
        health_summary(&first),
        vec![
            ("GPU-A-_-0".to_string(), "Healthy".to_string()),
            ("GPU-A-_-1".to_string(), "Healthy".to_string()),
            ("GPU-B-_-0".to_string(), "Healthy".to_string()),
            ("GPU-B-_-1".to_string(), "Healthy".to_string()),
        ]
    );

    let response = client
        .allocate(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec!["GPU-A-_-0".to_string(), "GPU-A-_-1".to_string()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.container_responses.len(), 1);
    assert_eq!(
        response.container_responses[0].envs.get("NVIDIA_VISIBLE_DEVICES"),
        Some(&"GPU-A-_-0,GPU-A-_-1".to_string())
    );

    let rejected = client
        .allocate(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec!["GPU-Z-_-0".to_string()],
            }],
        })
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), tonic::Code::InvalidArgument);

    backend.push_events([CriticalEvent {
        uuid: Some("GPU-B".to_string()),
        xid: 79,
    }]);
    let second = tokio::time::timeout(Duration::from_secs(10), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        health_summary(&second),
        vec![
            ("GPU-A-_-0".to_string(), "Healthy".to_string()),
            ("GPU-A-_-1".to_string(), "Healthy".to_string()),
            ("GPU-B-_-0".to_string(), "Unhealthy".to_string()),
            ("GPU-B-_-1".to_string(), "Unhealthy".to_string()),
        ]
    );

    plugin.stop().await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(10), stream.message())
        .await
        .unwrap();
    assert!(!matches!(end, Ok(Some(_))));
    assert!(!config.socket_path().exists());

    kubelet_stop.cancel();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn plugin_restart_reregisters_with_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet = FakeKubelet::default();
    let kubelet_stop = serve_fake_kubelet(dir.path(), kubelet.clone());

    let config = Arc::new(PluginConfig {
        device_plugin_path: dir.path().to_path_buf(),
        memory_unit: MemoryUnit::MiB,
        ..PluginConfig::default()
    });
    let backend = Arc::new(MockBackend::default().with_devices([gpu("GPU-A", 4, 0)]));

    for _ in 0..2 {
        let devices =
            DeviceVirtualizer::new(config.memory_unit).slice(&backend.devices().unwrap());
        let mut plugin = SharedGpuPlugin::new(config.clone(), backend.clone(), devices);
        plugin.serve().await.unwrap();
        plugin.stop().await.unwrap();
    }

    assert_eq!(kubelet.requests.lock().unwrap().len(), 2);
    kubelet_stop.cancel();
}
