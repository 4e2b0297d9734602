//! Termination signal handling.
//!
//! SIGINT and SIGTERM shut the publisher down and then exit the process with
//! status 0. The handler is installed at most once per process. If SIGTERM
//! cannot be registered, SIGINT is still handled.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal;
use tracing::{error, info, warn};

use crate::queue::{Publisher, ShutdownOutcome};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the termination handler for `publisher`.
///
/// Returns `false` if a handler was already installed. Must be called from
/// within a tokio runtime.
pub fn install_shutdown_handler(publisher: Publisher) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "sigterm_handler_install_failed");
                None
            }
        };

        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                result = signal::ctrl_c() => result.map(|_| "SIGINT"),
                _ = terminate_received(&mut terminate) => Ok("SIGTERM"),
            };

            #[cfg(not(unix))]
            let received = signal::ctrl_c().await.map(|_| "CTRL_C");

            match received {
                Ok(name) => {
                    info!(signal = name, "shutdown_signal_received");
                    // Each signal gets its own task; the publisher coalesces
                    // overlapping shutdowns into one.
                    let publisher = publisher.clone();
                    tokio::spawn(async move {
                        let outcome = shutdown(&publisher).await;
                        info!(outcome = ?outcome, "shutdown_complete");
                        std::process::exit(0);
                    });
                }
                Err(e) => {
                    error!(error = %e, "sigint_handler_install_failed");
                    return;
                }
            }
        }
    });

    true
}

/// Resolve on the next SIGTERM. Never resolves without a registered stream.
#[cfg(unix)]
async fn terminate_received(stream: &mut Option<signal::unix::Signal>) {
    if let Some(sigterm) = stream {
        if sigterm.recv().await.is_some() {
            return;
        }
        *stream = None;
    }
    std::future::pending::<()>().await
}

/// Run the publisher shutdown for a received signal.
pub async fn shutdown(publisher: &Publisher) -> ShutdownOutcome {
    let outcome = publisher.shutdown().await;
    if outcome == ShutdownOutcome::NothingToClose {
        info!("no_broker_connection_to_close");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let publisher = Publisher::amqp(Config::default());

        assert!(install_shutdown_handler(publisher.clone()));
        assert!(!install_shutdown_handler(publisher));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_sigterm_stream_never_fires() {
        use futures::FutureExt;

        let mut terminate = None;
        assert!(terminate_received(&mut terminate).now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_connection() {
        let publisher = Publisher::amqp(Config::default());

        assert_eq!(shutdown(&publisher).await, ShutdownOutcome::NothingToClose);
    }
}
