//! Reconnection supervisor
//!
//! Runs for the whole life of the client. Every poll interval it checks the
//! connection; when it is not connected it retries, waiting the retry backoff
//! after each failure. There is no attempt limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::network::connection::ConnectionManager;

/// Supervise `manager` until `shutdown` becomes true.
///
/// `initial_failed` tells the supervisor the caller's own connect just
/// failed, so the first retry waits the backoff instead of the poll interval.
pub async fn run_supervisor(
    manager: Arc<ConnectionManager>,
    address: String,
    initial_failed: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = manager.settings().poll_interval();
    let backoff = manager.settings().retry_backoff();
    let mut delay = if initial_failed { backoff } else { poll };
    let mut attempts: u64 = 0;

    loop {
        if wait_or_shutdown(delay, &mut shutdown).await {
            break;
        }

        if manager.is_connected() {
            delay = poll;
            continue;
        }

        manager.mark_reconnecting();
        attempts += 1;
        tracing::info!("Reconnect attempt {} to {}", attempts, address);

        match manager.connect(&address).await {
            Ok(()) => {
                tracing::info!("Reconnected after {} attempt(s)", attempts);
                attempts = 0;
                delay = poll;
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                delay = backoff;
            }
        }
    }

    tracing::debug!("Reconnect supervisor stopped");
}

/// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
