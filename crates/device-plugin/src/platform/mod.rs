//! Adapters to the outside world: kubelet, NVML, filesystem and signals.

pub mod dump;
pub mod k8s;
pub mod nvml;
pub mod watchers;
