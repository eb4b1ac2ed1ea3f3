//! Plugin lifecycle supervision.
//!
//! The supervisor restarts the device plugin whenever the kubelet comes back
//! (its registration socket is recreated) or a reload is requested, and shuts
//! it down on termination signals. Event handling is a pure transition on
//! [`Supervisor::handle_event`]; [`Supervisor::run`] drives it from a channel
//! so the sources (inotify, signals) stay outside.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::platform::dump;
use crate::platform::k8s::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SupervisorState {
    /// Nothing started yet.
    Idle,
    /// A (re)start is pending or has failed and will be retried.
    Restarting,
    /// The plugin is registered and serving.
    Running,
    /// Shut down, the loop has exited.
    Stopped,
}

/// Everything the supervisor reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The kubelet registration socket was (re)created.
    KubeletSocketCreated,
    /// The filesystem watcher reported an error.
    WatchError(String),
    /// SIGHUP.
    Reload,
    /// SIGQUIT.
    Dump,
    /// Any other handled signal, carries its name.
    Terminate(String),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Dump,
    Shutdown,
}

/// A running plugin instance as seen by the supervisor.
#[async_trait]
pub trait ManagedPlugin: Send {
    async fn stop(&mut self) -> Result<(), Report<PluginError>>;

    /// One line summary for diagnostic dumps.
    fn status(&self) -> String;
}

/// Builds and serves a fresh plugin instance.
#[async_trait]
pub trait PluginLauncher: Send {
    type Plugin: ManagedPlugin;

    /// Enumerates devices, builds a plugin and serves it. A
    /// [`PluginError::Enumeration`] failure is fatal to the supervisor.
    async fn launch(&mut self) -> Result<Self::Plugin, Report<PluginError>>;
}

pub struct Supervisor<L: PluginLauncher> {
    launcher: L,
    state: SupervisorState,
    needs_restart: bool,
    current: Option<L::Plugin>,
    restart_interval: Duration,
    dump_dir: PathBuf,
}

impl<L: PluginLauncher> Supervisor<L> {
    pub fn new(launcher: L, restart_interval: Duration, dump_dir: PathBuf) -> Self {
        Self {
            launcher,
            state: SupervisorState::Idle,
            needs_restart: true,
            current: None,
            restart_interval,
            dump_dir,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    /// Applies one event to the state machine.
    pub fn handle_event(&mut self, event: SupervisorEvent) -> Action {
        if self.state == SupervisorState::Stopped {
            return Action::None;
        }

        match event {
            SupervisorEvent::KubeletSocketCreated => {
                info!("inotify: kubelet socket created, restarting");
                self.request_restart();
                Action::None
            }
            SupervisorEvent::WatchError(e) => {
                warn!("inotify: {e}");
                Action::None
            }
            SupervisorEvent::Reload => {
                info!("received SIGHUP, restarting");
                self.request_restart();
                Action::None
            }
            SupervisorEvent::Dump => Action::Dump,
            SupervisorEvent::Terminate(signal) => {
                info!("received signal {signal}, shutting down");
                self.state = SupervisorState::Stopped;
                Action::Shutdown
            }
        }
    }

    fn request_restart(&mut self) {
        self.needs_restart = true;
        self.state = SupervisorState::Restarting;
    }

    /// Stops the current plugin and launches a new one. Only enumeration
    /// failures are returned, anything else is retried later.
    async fn restart(&mut self) -> Result<(), Report<PluginError>> {
        self.state = SupervisorState::Restarting;
        if let Some(mut plugin) = self.current.take() {
            if let Err(e) = plugin.stop().await {
                warn!("failed to stop device plugin: {e:?}");
            }
        }

        match self.launcher.launch().await {
            Ok(plugin) => {
                self.current = Some(plugin);
                self.needs_restart = false;
                self.state = SupervisorState::Running;
                Ok(())
            }
            Err(e) if matches!(e.current_context(), PluginError::Enumeration) => {
                error!("failed to enumerate devices: {e:?}");
                Err(e)
            }
            Err(e) => {
                warn!("failed to start device plugin due to {e:?}");
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) {
        self.state = SupervisorState::Stopped;
        if let Some(mut plugin) = self.current.take() {
            if let Err(e) = plugin.stop().await {
                warn!("failed to stop device plugin: {e:?}");
            }
        }
    }

    /// Renders the process state written on SIGQUIT.
    pub fn dump_report(&self) -> String {
        let plugin = self
            .current
            .as_ref()
            .map(|plugin| plugin.status())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "version: {} ({})\nstate: {}\nneeds_restart: {}\nplugin: {}\n\n{}\n",
            &**utils::version::VERSION,
            utils::version::branch(),
            self.state,
            self.needs_restart,
            plugin,
            std::backtrace::Backtrace::force_capture(),
        )
    }

    async fn write_dump(&self) {
        match dump::write_dump(&self.dump_dir, &self.dump_report()).await {
            Ok(path) => info!("dumped process state to {}", path.display()),
            Err(e) => error!("write dump to {} failed: {e}", self.dump_dir.display()),
        }
    }

    /// Runs until a terminate event arrives or the event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SupervisorEvent>,
    ) -> Result<(), Report<PluginError>> {
        loop {
            if self.needs_restart {
                self.restart().await?;
            }

            let event = if self.needs_restart {
                tokio::select! {
                    event = events.recv() => event,
                    _ = tokio::time::sleep(self.restart_interval) => continue,
                }
            } else {
                events.recv().await
            };

            let Some(event) = event else {
                info!("event sources closed, shutting down");
                self.shutdown().await;
                break;
            };

            match self.handle_event(event) {
                Action::None => {}
                Action::Dump => self.write_dump().await,
                Action::Shutdown => {
                    self.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }
}
