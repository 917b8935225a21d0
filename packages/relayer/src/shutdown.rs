//! Cooperative shutdown helpers over a `watch::Receiver<bool>`
//!
//! `true` means stop. A dropped sender counts as a stop request too.

use std::time::Duration;

use tokio::sync::watch;

pub fn is_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay` unless shutdown is requested first. Returns true on shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_requested(shutdown) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || is_requested(shutdown),
    }
}

/// Resolves once shutdown is requested
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    while !is_requested(shutdown) {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
