use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::service::LeaseExpiryScanner;

/// Periodically returns expired leases to their queues until `shutdown`
/// fires. One reaper can watch any number of queues.
pub fn spawn_lease_reaper(
    queues: Vec<Arc<dyn LeaseExpiryScanner>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lease reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    for queue in &queues {
                        if let Err(err) = queue.scan_expired_leases().await {
                            warn!("lease reaper scan_expired_leases error: {err}");
                        }
                    }
                }
            }
        }
    })
}
