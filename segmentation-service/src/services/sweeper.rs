use crate::services::SessionStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodically removes segmented sessions older than a fixed age.
pub struct SessionSweeper {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl SessionSweeper {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ttl: Duration,
        interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            ttl,
            interval,
            shutdown_token,
        }
    }

    /// Removes every expired session and returns how many went away.
    pub async fn sweep_once(&self) -> usize {
        let ttl = match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::error!(error = %e, "Session TTL out of range, skipping sweep");
                return 0;
            }
        };
        let cutoff = Utc::now() - ttl;

        let mut removed = 0;
        for id in self.store.segmented_before(cutoff).await {
            match self.store.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to sweep session"),
            }
        }

        if removed > 0 {
            metrics::counter!("segmentation_sessions_swept_total").increment(removed as u64);
            tracing::info!(removed, "Expired sessions swept");
        }

        removed
    }

    pub fn start(self) -> JoinHandle<()> {
        tracing::info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting session sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        tracing::info!("Session sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}
