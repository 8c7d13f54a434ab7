use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::shutdown::ShutdownSignal;
use crate::config::StoreConfig;
use crate::services::{EventStore, Reconciler, SweepReport};
use crate::utils::time::to_chrono;

/// Periodic staleness/expiry pass over the store, on its own timeline.
#[derive(Clone)]
pub struct Sweeper {
    store: EventStore,
    reconciler: Reconciler,
    config: StoreConfig,
}

impl Sweeper {
    pub fn new(store: EventStore, reconciler: Reconciler, config: StoreConfig) -> Self {
        Self {
            store,
            reconciler,
            config,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self
            .store
            .sweep(now, to_chrono(self.config.stale_after), to_chrono(self.config.gc_after))
            .await;
        if report.is_empty() {
            debug!("Sweep found nothing to change");
        } else {
            self.reconciler.on_sweep(&report).await;
        }
        report
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            "Sweeper started (every {:?}, stale after {:?}, purge {:?} later)",
            self.config.sweep_interval, self.config.stale_after, self.config.gc_after
        );
        while shutdown.sleep(self.config.sweep_interval).await {
            self.sweep_once(Utc::now()).await;
        }
        info!("Sweeper stopped");
    }
}
