//! Graceful shutdown coordination via `CancellationToken`.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::WorkerError;

/// Process signals that start the graceful shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Terminate,
    Interrupt,
    Quit,
    Abort,
    TerminalStop,
}

impl ShutdownSignal {
    pub const ALL: [ShutdownSignal; 6] = [
        ShutdownSignal::Hangup,
        ShutdownSignal::Terminate,
        ShutdownSignal::Interrupt,
        ShutdownSignal::Quit,
        ShutdownSignal::Abort,
        ShutdownSignal::TerminalStop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Abort => "SIGABRT",
            ShutdownSignal::TerminalStop => "SIGTSTP",
        }
    }

    #[cfg(unix)]
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Quit => SignalKind::quit(),
            ShutdownSignal::Abort => SignalKind::from_raw(libc::SIGABRT),
            ShutdownSignal::TerminalStop => SignalKind::from_raw(libc::SIGTSTP),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cloneable shutdown trigger shared by the signal listener and the worker.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    signal: Arc<OnceLock<ShutdownSignal>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown on behalf of `signal`. Only the first signal is kept.
    pub fn trigger(&self, signal: ShutdownSignal) {
        let _ = self.signal.set(signal);
        self.token.cancel();
    }

    /// Initiate shutdown without a signal, e.g. from tests or an embedding app.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        self.signal.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Waits for the first of the shutdown signals.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<ShutdownSignal, WorkerError> {
    use futures_util::future::select_all;
    use tokio::signal::unix::signal;

    let mut listeners = Vec::with_capacity(ShutdownSignal::ALL.len());
    for kind in ShutdownSignal::ALL {
        listeners.push((kind, signal(kind.kind())?));
    }

    let waits = listeners.iter_mut().map(|(kind, listener)| {
        let kind = *kind;
        Box::pin(async move {
            listener.recv().await;
            kind
        })
    });
    let (received, _, _) = select_all(waits).await;
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<ShutdownSignal, WorkerError> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// Triggers `coordinator` on the first shutdown signal.
pub fn spawn_signal_listener(coordinator: ShutdownCoordinator) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(%signal, "received shutdown signal");
                coordinator.trigger(signal);
            }
            Err(e) => error!(error = %e, "could not install signal handlers"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.signal(), None);
    }

    #[test]
    fn trigger_records_first_signal_only() {
        let coord = ShutdownCoordinator::new();
        coord.trigger(ShutdownSignal::Terminate);
        coord.trigger(ShutdownSignal::Interrupt);
        assert!(coord.is_shutting_down());
        assert_eq!(coord.signal(), Some(ShutdownSignal::Terminate));
    }

    #[test]
    fn clones_share_state() {
        let coord = ShutdownCoordinator::new();
        let clone = coord.clone();
        let token = coord.token();
        clone.trigger(ShutdownSignal::Hangup);
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
        assert_eq!(coord.signal(), Some(ShutdownSignal::Hangup));
    }

    #[test]
    fn plain_shutdown_has_no_signal() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert_eq!(coord.signal(), None);
    }

    #[test]
    fn signal_names() {
        let names: Vec<&str> = ShutdownSignal::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["SIGHUP", "SIGTERM", "SIGINT", "SIGQUIT", "SIGABRT", "SIGTSTP"]
        );
        assert_eq!(ShutdownSignal::Quit.to_string(), "SIGQUIT");
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let coord = ShutdownCoordinator::new();
        let waiter = coord.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        coord.trigger(ShutdownSignal::Interrupt);
        assert!(handle.await.unwrap());
    }
}
