use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use super::QuotaSweeper;

#[derive(Debug, Clone)]
pub struct QuotaWorkerConfig {
    pub interval: Duration,
}

impl Default for QuotaWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

pub struct QuotaWorker {
    sweeper: Arc<QuotaSweeper>,
    config: QuotaWorkerConfig,
}

impl QuotaWorker {
    pub fn new(sweeper: Arc<QuotaSweeper>, config: QuotaWorkerConfig) -> Self {
        Self { sweeper, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting quota worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweeper.sweep().await {
                        error!(error = %e, "Quota sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Quota worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
