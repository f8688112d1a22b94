//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! One [`SigDown`] instance is created at startup; its cancellation token is
//! cloned into the HTTP server, the webhook worker, and the idempotency
//! sweeper so all of them wind down together on the first signal.

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Signal listener that fans a shutdown signal into a cancellation token.
pub struct SigDown {
    _task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    /// Register the signal handlers. Fails if signal registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let inner = CancellationToken::new();
        let outer = inner.clone();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    inner.cancel();
                },
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    inner.cancel();
                }
            }
        });
        task_tracker.close();
        Ok(Self {
            _task_tracker: task_tracker,
            cancellation_token: outer,
        })
    }

    /// A clone of the shutdown token for distributing to subsystems.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}
