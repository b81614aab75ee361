//! Background sweep of expired auth codes.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::AuthCodeStore;

/// Default sweep interval in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Spawn a background task that periodically removes expired codes.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_sweep_task(
    store: Arc<AuthCodeStore>,
    sweep_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_interval_secs));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.evict_expired() {
                Ok(count) => {
                    if count > 0 {
                        info!(evicted = count, "Auth code sweep completed");
                    } else {
                        debug!("Auth code sweep: nothing expired");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Auth code sweep failed");
                }
            }

            match store.pending_count() {
                Ok(count) => {
                    debug!(pending_codes = count, "Auth code store status");
                }
                Err(e) => {
                    debug!(error = %e, "Failed to get pending code count");
                }
            }
        }
    })
}
