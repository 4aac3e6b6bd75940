use std::sync::Arc;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

use crate::manager::SandboxManager;

/// Termination signal that triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(self) -> u8 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Wait for SIGINT or SIGTERM, then kill and clean up every active execution.
///
/// Returns which signal arrived so the caller can exit accordingly.
pub async fn shutdown_on_signal(manager: Arc<SandboxManager>) -> ShutdownSignal {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    let received = tokio::select! {
        _ = recv_signal(&mut sigterm) => ShutdownSignal::Terminate,
        _ = recv_signal(&mut sigint) => ShutdownSignal::Interrupt,
    };
    info!(signal = ?received, "received shutdown signal, cleaning up");
    manager.cleanup_all();
    received
}
