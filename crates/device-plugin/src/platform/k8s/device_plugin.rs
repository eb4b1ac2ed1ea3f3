#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::constants;
use super::types::DialError;
use super::types::PluginError;
use crate::config::PluginConfig;
use crate::domain::backend::DeviceBackend;
use crate::domain::health::HealthMonitor;
use crate::domain::health::UnhealthyDevices;
use crate::domain::virtual_device::Health;
use crate::domain::virtual_device::VirtualDeviceSet;

/// Bound for every dial: the readiness self-check and the kubelet connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared GPU device plugin, one instance per supervisor restart.
///
/// The virtual device set is published through a watch channel. The health
/// loop spawned by [`SharedGpuPlugin::start`] owns the only sender; gRPC
/// handlers only ever read.
pub struct SharedGpuPlugin {
    config: Arc<PluginConfig>,
    backend: Arc<dyn DeviceBackend>,
    socket: PathBuf,
    devices: watch::Receiver<VirtualDeviceSet>,
    publisher: Option<watch::Sender<VirtualDeviceSet>>,
    stop: CancellationToken,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    health_loop: Option<JoinHandle<()>>,
    health_monitor: Option<JoinHandle<()>>,
}

impl SharedGpuPlugin {
    pub fn new(
        config: Arc<PluginConfig>,
        backend: Arc<dyn DeviceBackend>,
        devices: VirtualDeviceSet,
    ) -> Self {
        info!(
            devices = devices.len(),
            physical = ?devices.physical_ids(),
            "created device plugin"
        );
        let (publisher, devices) = watch::channel(devices);

        Self {
            socket: config.socket_path(),
            config,
            backend,
            devices,
            publisher: Some(publisher),
            stop: CancellationToken::new(),
            server: None,
            health_loop: None,
            health_monitor: None,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    /// Receiver of the published device set.
    pub fn devices(&self) -> watch::Receiver<VirtualDeviceSet> {
        self.devices.clone()
    }

    /// Starts the gRPC server, waits until it accepts connections, then
    /// launches the health loop.
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        let socket = self.socket.clone();
        let start_error = || PluginError::Start {
            socket: socket.clone(),
        };
        info!("start device plugin server: {}", self.socket.display());

        self.cleanup().change_context_lazy(start_error)?;
        let listener = UnixListener::bind(&self.socket).change_context_lazy(start_error)?;

        let service = DevicePluginService::new(self.devices.clone(), self.stop.clone());
        let device_plugin_server = DevicePluginServer::new(service);
        let stop = self.stop.clone();

        self.server = Some(tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(device_plugin_server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        stop.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
        }));

        // wait for the server to come up with a blocking connection
        if let Err(e) = dial(&self.socket, DIAL_TIMEOUT).await {
            if let Err(stop_err) = self.stop().await {
                warn!("failed to clean up after readiness check: {stop_err:?}");
            }
            return Err(e.change_context(start_error()));
        }

        self.health_loop = self.spawn_health_loop();
        Ok(())
    }

    /// Registers this plugin's socket and resource with the kubelet.
    pub async fn register(
        &self,
        kubelet_socket: &Path,
        resource_name: &str,
    ) -> Result<(), Report<PluginError>> {
        let register_error = || PluginError::Register {
            endpoint: kubelet_socket.to_path_buf(),
        };

        let channel = dial(kubelet_socket, DIAL_TIMEOUT)
            .await
            .change_context_lazy(register_error)?;
        debug!("dial {} success", kubelet_socket.display());

        let endpoint = self
            .socket
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = RegisterRequest {
            version: constants::API_VERSION.to_string(),
            endpoint,
            resource_name: resource_name.to_string(),
            options: Some(DevicePluginOptions::default()),
        };

        let mut client = RegistrationClient::new(channel);
        tokio::time::timeout(DIAL_TIMEOUT, client.register(Request::new(request)))
            .await
            .change_context_lazy(register_error)?
            .change_context_lazy(register_error)?;

        Ok(())
    }

    /// Starts the server and registers it with the kubelet. A failed
    /// registration stops the server again before the error is returned.
    pub async fn serve(&mut self) -> Result<(), Report<PluginError>> {
        self.start().await?;
        info!("starting to serve on {}", self.socket.display());

        let kubelet_socket = self.config.kubelet_socket();
        if let Err(e) = self
            .register(&kubelet_socket, &self.config.resource_name)
            .await
        {
            error!("could not register device plugin: {e:?}");
            if let Err(stop_err) = self.stop().await {
                error!("stop device plugin failed: {stop_err:?}");
            }
            return Err(e);
        }

        info!(
            "registered device plugin with kubelet, resource name: {}",
            self.config.resource_name
        );
        Ok(())
    }

    /// Stops serving and removes the socket. No-op when not serving.
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };

        self.stop.cancel();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {e}"),
            Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!("gRPC server did not shut down in time, aborting");
                server.abort();
            }
        }
        if let Some(health_loop) = self.health_loop.take() {
            if let Err(e) = health_loop.await {
                warn!("health loop task failed: {e}");
            }
        }
        // the monitor holds the event subscription until its current wait returns
        if let Some(health_monitor) = self.health_monitor.take() {
            if let Err(e) = health_monitor.await {
                warn!("health monitor task failed: {e}");
            }
        }

        self.cleanup().change_context_lazy(|| PluginError::Stop {
            socket: self.socket.clone(),
        })
    }

    fn cleanup(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.socket) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Single writer of the device set: applies unhealthy notifications from
    /// the health monitor and publishes the updated set.
    fn spawn_health_loop(&mut self) -> Option<JoinHandle<()>> {
        let publisher = self.publisher.take()?;
        let (unhealthy_tx, mut unhealthy_rx) = mpsc::channel::<UnhealthyDevices>(16);

        if self.config.health_check {
            let physical_ids = self
                .devices
                .borrow()
                .physical_ids()
                .iter()
                .map(|id| id.to_string())
                .collect();
            self.health_monitor = Some(
                HealthMonitor::new(self.backend.clone(), physical_ids)
                    .spawn(unhealthy_tx, self.stop.child_token()),
            );
        } else {
            drop(unhealthy_tx);
        }

        let stop = self.stop.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    Some(target) = unhealthy_rx.recv() => publish_unhealthy(&publisher, &target),
                }
            }
            debug!("health loop stopped");
        }))
    }
}

/// Marks `target` unhealthy and notifies the watchers if anything changed.
fn publish_unhealthy(publisher: &watch::Sender<VirtualDeviceSet>, target: &UnhealthyDevices) {
    publisher.send_if_modified(|set| {
        let changed = set.mark_unhealthy(target);
        if changed > 0 {
            warn!(
                "marked {changed} devices unhealthy ({target:?}), {} healthy left",
                set.healthy_count()
            );
        }
        changed > 0
    });
}

/// DevicePlugin service implementation
pub struct DevicePluginService {
    devices: watch::Receiver<VirtualDeviceSet>,
    /// closed once when the owning plugin stops
    stop: CancellationToken,
}

impl DevicePluginService {
    pub fn new(devices: watch::Receiver<VirtualDeviceSet>, stop: CancellationToken) -> Self {
        Self { devices, stop }
    }
}

fn list_response(devices: &VirtualDeviceSet) -> ListAndWatchResponse {
    let devices = devices
        .iter()
        .map(|device| api::Device {
            id: device.fake_id.clone(),
            health: match device.health {
                Health::Healthy => constants::HEALTHY,
                Health::Unhealthy => constants::UNHEALTHY,
            }
            .to_string(),
            topology: None,
        })
        .collect();
    ListAndWatchResponse { devices }
}

/// Validates every requested id and builds one response per container.
/// A single unknown id rejects the whole request.
fn allocate_response(
    devices: &VirtualDeviceSet,
    request: &AllocateRequest,
) -> Result<AllocateResponse, Status> {
    let unknown = request
        .container_requests
        .iter()
        .flat_map(|container| container.devices_ids.iter())
        .find(|id| !devices.contains(id));
    if let Some(id) = unknown {
        return Err(Status::invalid_argument(format!(
            "invalid allocation request: unknown device: {id}"
        )));
    }

    let container_responses = request
        .container_requests
        .iter()
        .map(|container| ContainerAllocateResponse {
            envs: HashMap::from([(
                constants::ENV_NVIDIA_VISIBLE_DEVICES.to_string(),
                container.devices_ids.join(","),
            )]),
            ..Default::default()
        })
        .collect();

    Ok(AllocateResponse {
        container_responses,
    })
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the full device list, then the full list again after every
    /// health change, until the plugin stops.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut devices = self.devices.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let initial_response = list_response(&devices.borrow_and_update());
            let count = initial_response.devices.len();
            if let Err(e) = tx.send(Ok(initial_response)) {
                error!("failed to send initial device list: {}", e);
                return;
            }
            info!("sent device list with {count} devices");

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tx.closed() => {
                        debug!("ListAndWatch client went away");
                        break;
                    }
                    changed = devices.changed() => {
                        if changed.is_err() {
                            // publisher gone, nothing will change until stop
                            stop.cancelled().await;
                            break;
                        }
                        let response = list_response(&devices.borrow_and_update());
                        if tx.send(Ok(response)).is_err() {
                            break;
                        }
                        info!("resent device list after health change");
                    }
                }
            }
            info!("device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        let response = PreferredAllocationResponse {
            container_responses: vec![],
        };
        Ok(Response::new(response))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        for container in &req.container_requests {
            info!("allocate request, device IDs: {:?}", container.devices_ids);
        }

        let response = allocate_response(&self.devices.borrow(), &req);
        match response {
            Ok(response) => Ok(Response::new(response)),
            Err(status) => {
                warn!("{}", status.message());
                Err(status)
            }
        }
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Opens a gRPC channel over a unix socket, bounded by `timeout`.
pub async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel, Report<DialError>> {
    let dial_error = || DialError {
        socket: socket_path.to_path_buf(),
    };
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using Unix socket connector
    let endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = socket_path.clone();
        async move {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => Ok(TokioIo::new(stream)),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
    }));

    tokio::time::timeout(timeout, connect)
        .await
        .change_context_lazy(dial_error)?
        .change_context_lazy(dial_error)
}
