use std::path::PathBuf;

use thiserror::Error;

/// Errors of the device plugin lifecycle.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to enumerate devices")]
    Enumeration,
    #[error("failed to start device plugin on {}", socket.display())]
    Start { socket: PathBuf },
    #[error("failed to register device plugin with kubelet at {}", endpoint.display())]
    Register { endpoint: PathBuf },
    #[error("failed to stop device plugin on {}", socket.display())]
    Stop { socket: PathBuf },
}

/// Failure to open a gRPC channel over a unix socket.
#[derive(Debug, Error)]
#[error("failed to dial {}", socket.display())]
pub struct DialError {
    pub socket: PathBuf,
}
