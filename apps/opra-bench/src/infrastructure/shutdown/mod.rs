//! Shutdown Signals
//!
//! Bridges Ctrl+C and SIGTERM onto the shared [`CancellationToken`] the
//! publish and subscribe loops poll, and bounds how long a loop may keep
//! running once its peer is done.

use std::time::Duration;

use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Wait for Ctrl+C, SIGTERM or `token` being cancelled elsewhere, then
/// cancel `token`.
///
/// A signal handler that cannot be installed is logged and ignored; the
/// token still ends the wait.
pub async fn await_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = token.cancelled() => {
            return;
        }
    }

    token.cancel();
}

/// Wait for `task`, letting it finish on its own for up to `drain`, then
/// cancel `token` and wait for it to stop.
///
/// # Errors
///
/// Returns the [`JoinError`] if the task panicked or was aborted.
pub async fn drain_or_cancel<T>(
    mut task: JoinHandle<T>,
    drain: Duration,
    token: &CancellationToken,
) -> Result<T, JoinError> {
    tokio::select! {
        joined = &mut task => joined,
        () = tokio::time::sleep(drain) => {
            tracing::warn!(?drain, "Still running after drain timeout, cancelling");
            token.cancel();
            task.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_cancels_a_task_that_never_finishes() {
        let token = CancellationToken::new();
        let waiting = token.clone();
        let task = tokio::spawn(async move {
            waiting.cancelled().await;
            7
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            drain_or_cancel(task, Duration::from_millis(20), &token),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result, 7);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn drain_leaves_a_finished_task_alone() {
        let token = CancellationToken::new();
        let task = tokio::spawn(async { "done" });

        let result = drain_or_cancel(task, Duration::from_secs(5), &token)
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn returns_once_token_is_cancelled() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(await_shutdown(token.clone()));

        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
