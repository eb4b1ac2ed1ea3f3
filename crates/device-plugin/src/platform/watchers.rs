//! Event sources feeding the supervisor: the kubelet socket directory and
//! process signals.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::domain::supervisor::SupervisorEvent;

#[derive(Debug, thiserror::Error)]
#[error("failed to watch {}", path.display())]
pub struct WatchError {
    pub path: PathBuf,
}

/// Maps a raw filesystem notification to a supervisor event.
pub fn translate_fs_event(
    res: Result<Event, notify::Error>,
    kubelet_socket: &Path,
) -> Option<SupervisorEvent> {
    match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Create(_))
                && event.paths.iter().any(|p| p == kubelet_socket)
            {
                Some(SupervisorEvent::KubeletSocketCreated)
            } else {
                None
            }
        }
        Err(e) => Some(SupervisorEvent::WatchError(e.to_string())),
    }
}

/// Watches `dir` (non recursively) for the kubelet socket being recreated.
/// Events stop once the returned watcher is dropped.
pub fn watch_kubelet_socket(
    dir: &Path,
    kubelet_socket: PathBuf,
    tx: mpsc::Sender<SupervisorEvent>,
) -> Result<RecommendedWatcher, Report<WatchError>> {
    let watch_error = || WatchError {
        path: dir.to_path_buf(),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            debug!("filesystem event: {res:?}");
            if let Some(event) = translate_fs_event(res, &kubelet_socket) {
                let _ = tx.blocking_send(event);
            }
        },
        Config::default(),
    )
    .change_context_lazy(watch_error)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .change_context_lazy(watch_error)?;
    info!("watching {} for kubelet restarts", dir.display());

    Ok(watcher)
}

/// Forwards SIGHUP, SIGQUIT, SIGINT and SIGTERM to `tx` until it closes.
pub fn spawn_signal_watcher(tx: mpsc::Sender<SupervisorEvent>) -> io::Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => SupervisorEvent::Reload,
                _ = sigquit.recv() => SupervisorEvent::Dump,
                _ = sigint.recv() => SupervisorEvent::Terminate("SIGINT".to_string()),
                _ = sigterm.recv() => SupervisorEvent::Terminate("SIGTERM".to_string()),
                _ = tx.closed() => break,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::event::CreateKind;
    use notify::event::ModifyKind;
    use notify::event::RemoveKind;
    use similar_asserts::assert_eq;

    use super::*;

    const SOCKET: &str = "/plugins/kubelet.sock";

    fn translate(kind: EventKind, path: &str) -> Option<SupervisorEvent> {
        let event = Event::new(kind).add_path(PathBuf::from(path));
        translate_fs_event(Ok(event), Path::new(SOCKET))
    }

    #[test]
    fn kubelet_socket_creation_triggers_restart() {
        assert_eq!(
            translate(EventKind::Create(CreateKind::File), SOCKET),
            Some(SupervisorEvent::KubeletSocketCreated)
        );
    }

    #[test]
    fn other_fs_events_are_ignored() {
        assert_eq!(
            translate(EventKind::Create(CreateKind::File), "/plugins/gpushare.sock"),
            None
        );
        assert_eq!(translate(EventKind::Remove(RemoveKind::File), SOCKET), None);
        assert_eq!(translate(EventKind::Modify(ModifyKind::Any), SOCKET), None);
    }

    #[test]
    fn watch_errors_are_forwarded() {
        let error = notify::Error::generic("queue overflow");
        let translated = translate_fs_event(Err(error), Path::new(SOCKET));
        assert!(matches!(
            translated,
            Some(SupervisorEvent::WatchError(msg)) if msg.contains("queue overflow")
        ));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn creating_kubelet_socket_in_watched_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let (tx, mut rx) = mpsc::channel(8);

        let _watcher = watch_kubelet_socket(dir.path(), socket.clone(), tx).unwrap();
        std::fs::write(dir.path().join("other"), b"").unwrap();
        std::fs::write(&socket, b"").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(SupervisorEvent::KubeletSocketCreated));
    }

    #[test]
    fn watching_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let (tx, _rx) = mpsc::channel(1);

        let err = watch_kubelet_socket(&missing, missing.join("kubelet.sock"), tx).unwrap_err();
        assert_eq!(err.current_context().path, missing);
    }

    #[test_log::test(tokio::test)]
    async fn signal_watcher_exits_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_signal_watcher(tx).unwrap();
        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
