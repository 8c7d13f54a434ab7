//! In-memory table of tracked events.
//!
//! The store is the only owner of event state. Readers get clones; mutation goes
//! through `upsert`, `sweep`, and the one-off `load_all`. The write lock is held for
//! one entry at a time: batches and sweeps release it between entries, and a sweep
//! re-checks each candidate under the lock so a concurrent upsert always wins.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{Event, EventFilter, EventId, EventStatus, NormalizedEvent};

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Snapshots of events flipped to `Lost` by this sweep.
    pub marked_lost: Vec<Event>,
    pub purged: Vec<EventId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_lost.is_empty() && self.purged.is_empty()
    }
}

enum Due {
    MarkLost,
    Purge,
}

#[derive(Clone, Default)]
pub struct EventStore {
    events: Arc<RwLock<HashMap<EventId, Event>>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a first sighting or refresh an existing one. A refreshed event is
    /// `Active` again even if it had been marked `Lost` but not yet purged.
    /// Returns the stored snapshot.
    pub async fn upsert(&self, normalized: NormalizedEvent, observed_at: DateTime<Utc>) -> Event {
        let mut events = self.events.write().await;
        apply_upsert(&mut events, normalized, observed_at)
    }

    /// Upsert a whole poll cycle, one entry per lock acquisition.
    pub async fn upsert_batch(&self, batch: Vec<NormalizedEvent>, observed_at: DateTime<Utc>) -> Vec<Event> {
        let mut upserted = Vec::with_capacity(batch.len());
        for normalized in batch {
            upserted.push(self.upsert(normalized, observed_at).await);
            tokio::task::yield_now().await;
        }
        upserted
    }

    /// Flip `Active` events idle for at least `stale_after` to `Lost`, and drop `Lost`
    /// events idle for at least `stale_after + gc_after`.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
        gc_after: chrono::Duration,
    ) -> SweepReport {
        let purge_after = stale_after.checked_add(&gc_after).unwrap_or(chrono::Duration::MAX);
        let due = |event: &Event| match event.status {
            EventStatus::Active if event.idle_for(now) >= stale_after => Some(Due::MarkLost),
            EventStatus::Lost if event.idle_for(now) >= purge_after => Some(Due::Purge),
            _ => None,
        };

        let candidates: Vec<EventId> = {
            let events = self.events.read().await;
            events
                .values()
                .filter(|&event| due(event).is_some())
                .map(|event| event.id.clone())
                .collect()
        };

        let mut report = SweepReport::default();
        for id in candidates {
            {
                let mut events = self.events.write().await;
                match events.get(&id).and_then(|event| due(event)) {
                    Some(Due::MarkLost) => {
                        if let Some(event) = events.get_mut(&id) {
                            event.mark_lost(now);
                            info!("Event {} marked lost (last_seen_at={})", id, event.last_seen_at);
                            report.marked_lost.push(event.clone());
                        }
                    }
                    Some(Due::Purge) => {
                        if let Some(event) = events.remove(&id) {
                            debug!("Event {} purged (last_seen_at={})", id, event.last_seen_at);
                            report.purged.push(id);
                        }
                    }
                    // refreshed since the scan
                    None => {}
                }
            }
            tokio::task::yield_now().await;
        }

        if !report.purged.is_empty() {
            info!("Purged {} lost event(s) from the cache", report.purged.len());
        }
        report
    }

    pub async fn get(&self, id: &EventId) -> Option<Event> {
        self.events.read().await.get(id).cloned()
    }

    /// Matching events, most recently seen first.
    pub async fn list(&self, filter: EventFilter) -> Vec<Event> {
        let mut matching: Vec<Event> = {
            let events = self.events.read().await;
            events.values().filter(|event| filter.matches(event)).cloned().collect()
        };
        matching.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    /// Start-up bulk load of previously persisted events, taken as-is. Entries with
    /// an id already present replace it. Returns how many were loaded.
    pub async fn load_all(&self, loaded: Vec<Event>) -> usize {
        let mut events = self.events.write().await;
        let mut count = 0;
        for mut event in loaded {
            // a persisted record with inverted timestamps would break the freshness invariant
            if event.last_seen_at < event.first_seen_at {
                event.last_seen_at = event.first_seen_at;
            }
            events.insert(event.id.clone(), event);
            count += 1;
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

fn apply_upsert(
    events: &mut HashMap<EventId, Event>,
    normalized: NormalizedEvent,
    observed_at: DateTime<Utc>,
) -> Event {
    match events.get_mut(&normalized.id) {
        Some(existing) => {
            if existing.status == EventStatus::Lost {
                info!("Event {} seen again, back to active", existing.id);
            }
            existing.refresh(normalized, observed_at);
            existing.clone()
        }
        None => {
            let event = Event::new(normalized, observed_at);
            events.insert(event.id.clone(), event.clone());
            event
        }
    }
}
