use std::sync::Arc;
use tracing::{debug, info, warn};

use super::durable::{DurableStore, NoopDurableStore};
use super::event_store::{EventStore, SweepReport};
use crate::models::Event;

/// Keeps the durable mirror in step with the in-memory store.
///
/// Every method here swallows persistence failures after logging them: the
/// in-memory table stays authoritative and the mirror catches up on the next
/// cycle that touches the same ids.
#[derive(Clone)]
pub struct Reconciler {
    durable: Arc<dyn DurableStore>,
}

impl Reconciler {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self { durable }
    }

    /// No durable backend.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopDurableStore))
    }

    pub fn backend(&self) -> &'static str {
        self.durable.name()
    }

    /// Persisted events for the start-up load. Empty if the backend is unreachable.
    pub async fn load_initial_events(&self) -> Vec<Event> {
        match self.durable.load_all().await {
            Ok(events) => {
                info!("Loaded {} event(s) from {}", events.len(), self.durable.name());
                events
            }
            Err(e) => {
                warn!("Could not load events from {}: {}", self.durable.name(), e);
                Vec::new()
            }
        }
    }

    /// Load persisted events into `store`. Returns how many were restored.
    pub async fn restore_into(&self, store: &EventStore) -> usize {
        let events = self.load_initial_events().await;
        if events.is_empty() {
            return 0;
        }
        store.load_all(events).await
    }

    /// Mirror the snapshots upserted by one poll cycle.
    pub async fn on_cycle_complete(&self, upserted: &[Event]) {
        self.persist(upserted, "poll cycle").await;
    }

    /// Mirror status flips from a sweep. Purged ids stay in the mirror as history.
    pub async fn on_sweep(&self, report: &SweepReport) {
        self.persist(&report.marked_lost, "sweep").await;
    }

    async fn persist(&self, events: &[Event], origin: &str) {
        if events.is_empty() {
            return;
        }
        match self.durable.upsert_many(events).await {
            Ok(()) => debug!("Persisted {} event(s) after {}", events.len(), origin),
            Err(e) => warn!(
                "Failed to persist {} event(s) to {} after {}: {}",
                events.len(),
                self.durable.name(),
                origin,
                e
            ),
        }
    }
}
