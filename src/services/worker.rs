use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::services::stash::UploadStash;
use crate::utils::keyed_mutex::KeyedMutex;

/// Periodic housekeeping: expired stash entries, idle sessions and unused key locks.
pub struct BackgroundWorker {
    stash: UploadStash,
    locks: KeyedMutex,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(stash: UploadStash, locks: KeyedMutex, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            stash,
            locks,
            interval: Duration::from_secs(3600),
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) {
        tracing::info!("🧹 Running stash cleanup...");

        match self.stash.remove_expired().await {
            Ok(removed) => tracing::info!(removed, "✅ Stash cleanup completed"),
            Err(e) => tracing::error!("Stash cleanup failed: {}", e),
        }

        self.locks.cleanup();
    }
}
