use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::services::webhook_processor::WebhookProcessor;

/// Re-drives logged webhook events whose processing failed.
pub struct WebhookRetryWorker {
    processor: Arc<WebhookProcessor>,
    interval_secs: u64,
}

impl WebhookRetryWorker {
    pub fn new(processor: Arc<WebhookProcessor>, interval_secs: u64) -> Self {
        Self {
            processor,
            interval_secs,
        }
    }

    /// One retry pass. Returns how many events were processed.
    pub async fn run_once(&self) -> usize {
        match self.processor.retry_pending().await {
            Ok(count) => {
                if count > 0 {
                    info!(processed = count, "Retried pending webhooks");
                }
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to retry pending webhooks");
                0
            }
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.interval_secs,
            "Webhook retry worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Webhook retry worker stopping");
                        break;
                    }
                }
            }
        }
    }
}
