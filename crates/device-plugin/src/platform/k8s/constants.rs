//! Names shared with the kubelet and with workloads consuming the resource.

/// Resource advertised to the kubelet, counted in memory slices.
pub const RESOURCE_NAME: &str = "shared-gpu/gpu-mem";
/// Whole-GPU count resource, declared for schedulers but not served here.
pub const RESOURCE_COUNT: &str = "shared-gpu/gpu-count";

pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const SERVER_SOCK: &str = "gpushare.sock";
pub const API_VERSION: &str = "v1beta1";

pub const DUMP_DIR: &str = "/etc/kubernetes";

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

pub const ENV_NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";

// Bookkeeping variables reserved for scheduler extenders, never populated by Allocate.
pub const ENV_RESOURCE_INDEX: &str = "SHARED_GPU_MEM_IDX";
pub const ENV_RESOURCE_BY_POD: &str = "SHARED_GPU_MEM_POD";
pub const ENV_RESOURCE_BY_CONTAINER: &str = "SHARED_GPU_MEM_CONTAINER";
pub const ENV_RESOURCE_BY_DEV: &str = "SHARED_GPU_MEM_DEV";
pub const ENV_ASSIGNED_FLAG: &str = "SHARED_GPU_MEM_ASSIGNED";
pub const ENV_RESOURCE_ASSUME_TIME: &str = "SHARED_GPU_MEM_ASSUME_TIME";
pub const ENV_RESOURCE_ASSIGN_TIME: &str = "SHARED_GPU_MEM_ASSIGN_TIME";

/// Every reserved bookkeeping variable, in declaration order.
pub const RESERVED_ENVS: [&str; 7] = [
    ENV_RESOURCE_INDEX,
    ENV_RESOURCE_BY_POD,
    ENV_RESOURCE_BY_CONTAINER,
    ENV_RESOURCE_BY_DEV,
    ENV_ASSIGNED_FLAG,
    ENV_RESOURCE_ASSUME_TIME,
    ENV_RESOURCE_ASSIGN_TIME,
];
