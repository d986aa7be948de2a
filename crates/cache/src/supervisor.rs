//! Reconnect-forever loop around one long-lived subscription.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mirra_cluster::{ClusterError, Subscription};
use mirra_core::WatchEvent;

/// Delay between a stream failure and the next open attempt. Fixed, no
/// jitter: failures are rare and the delay is small against typical outage
/// duration.
pub fn reconnect_delay() -> Duration {
    let secs = std::env::var("MIRRA_RECONNECT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(5);
    Duration::from_secs(secs)
}

/// Run one logical subscription until the consuming side goes away. Normal
/// events are forwarded into `tx`. A stream error or end-of-stream closes
/// the subscription, waits the fixed delay, and reopens; open failures are
/// logged and retried on the same cadence. Nothing here ever gives up on its
/// own.
pub async fn supervise<T, F, Fut>(label: String, open: F, tx: mpsc::Sender<WatchEvent<T>>)
where
    T: Send + 'static,
    F: Fn() -> Fut + Send,
    Fut: Future<Output = Result<Subscription<T>, ClusterError>> + Send,
{
    loop {
        match open().await {
            Ok(mut sub) => {
                debug!(watch = %label, "subscription open");
                loop {
                    match sub.next().await {
                        Some(Ok(ev)) => {
                            if tx.send(ev).await.is_err() {
                                // Consumer gone: session teardown.
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(watch = %label, error = %e, "watch error; reconnecting");
                            metrics::counter!("watch_reconnects_total", 1u64);
                            break;
                        }
                        None => {
                            warn!(watch = %label, "watch ended; reconnecting");
                            metrics::counter!("watch_reconnects_total", 1u64);
                            break;
                        }
                    }
                }
                sub.cancel.cancel();
            }
            Err(e) => {
                warn!(watch = %label, error = %e, "subscription open failed; retrying");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay()).await;
    }
}
