use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::poller::Poller;
use super::shutdown::Shutdown;
use super::sweeper::Sweeper;

/// Owns the poller and sweeper tasks. Both share one shutdown signal.
pub struct BackgroundScheduler {
    shutdown: Shutdown,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundScheduler {
    pub fn start<R>(poller: Poller<R>, sweeper: Sweeper) -> Self
    where
        R: Rng + Send + Sync + 'static,
    {
        let shutdown = Shutdown::new();
        let tasks = vec![
            ("poller", tokio::spawn(poller.run(shutdown.subscribe()))),
            ("sweeper", tokio::spawn(sweeper.run(shutdown.subscribe()))),
        ];
        info!("Background scheduler started");
        Self { shutdown, tasks }
    }

    /// Signal both loops and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task {} ended abnormally: {}", name, e);
            }
        }
        info!("Background scheduler stopped");
    }
}
