//! Fetch loop: upstream → decoder → normalizer → store.
//!
//! ```text
//! Idle -> Fetching -> Idle            (success, wait poll interval)
//!                  -> Backoff -> Fetching   (failure, wait backoff delay)
//! any -> Stopped                       (shutdown)
//! ```
//!
//! Cycle errors never leave this module; they only show up in `PollerHealth`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::shutdown::ShutdownSignal;
use crate::config::PollerConfig;
use crate::error::{CycleError, FetchError};
use crate::ingest::{Decoder, FeedSource, Normalizer};
use crate::services::{EventStore, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Idle,
    Fetching,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollerHealth {
    pub enabled: bool,
    pub state: PollerState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Events upserted by the last successful cycle.
    pub last_cycle_events: usize,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PollerHealth {
    pub fn running(&self) -> bool {
        self.enabled && self.state != PollerState::Stopped
    }

    pub fn degraded(&self) -> bool {
        self.consecutive_failures > 0
    }
}

/// Read handle on the poller's observability state, shared with the API.
#[derive(Debug, Clone)]
pub struct PollerStatus {
    inner: Arc<RwLock<PollerHealth>>,
}

impl PollerStatus {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PollerHealth {
                enabled,
                state: if enabled { PollerState::Idle } else { PollerState::Stopped },
                consecutive_failures: 0,
                last_error: None,
                last_attempt_at: None,
                last_success_at: None,
                last_cycle_events: 0,
                next_attempt_at: None,
            })),
        }
    }

    pub async fn snapshot(&self) -> PollerHealth {
        self.inner.read().await.clone()
    }

    async fn set_state(&self, state: PollerState) {
        self.inner.write().await.state = state;
    }

    async fn begin_attempt(&self, at: DateTime<Utc>) {
        let mut health = self.inner.write().await;
        health.state = PollerState::Fetching;
        health.last_attempt_at = Some(at);
        health.next_attempt_at = None;
    }

    async fn record_success(&self, at: DateTime<Utc>, upserted: usize, next: Duration) {
        let mut health = self.inner.write().await;
        health.state = PollerState::Idle;
        health.consecutive_failures = 0;
        health.last_error = None;
        health.last_success_at = Some(at);
        health.last_cycle_events = upserted;
        health.next_attempt_at = at.checked_add_signed(crate::utils::time::to_chrono(next));
    }

    async fn record_failure(&self, at: DateTime<Utc>, error: String, failures: u32, next: Duration) {
        let mut health = self.inner.write().await;
        health.state = PollerState::Backoff;
        health.consecutive_failures = failures;
        health.last_error = Some(error);
        health.next_attempt_at = at.checked_add_signed(crate::utils::time::to_chrono(next));
    }
}

/// Counts from one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub records: usize,
    pub upserted: usize,
}

pub struct Poller<R> {
    source: Arc<dyn FeedSource>,
    decoder: Decoder,
    normalizer: Normalizer,
    store: EventStore,
    reconciler: Reconciler,
    config: PollerConfig,
    backoff: Backoff<R>,
    status: PollerStatus,
}

impl<R: Rng + Send> Poller<R> {
    pub fn new(
        source: Arc<dyn FeedSource>,
        decoder: Decoder,
        normalizer: Normalizer,
        store: EventStore,
        reconciler: Reconciler,
        config: PollerConfig,
        rng: R,
    ) -> Self {
        Self {
            source,
            decoder,
            normalizer,
            store,
            reconciler,
            backoff: Backoff::new(config.backoff, rng),
            status: PollerStatus::new(config.enabled),
            config,
        }
    }

    pub fn status(&self) -> PollerStatus {
        self.status.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.consecutive_failures()
    }

    /// One fetch → decode → normalize → upsert pass, stamping events with `observed_at`.
    /// The fetch is bounded by the request timeout. Nothing is written on error.
    pub async fn run_cycle_at(&self, observed_at: DateTime<Utc>) -> Result<CycleSummary, CycleError> {
        let timeout = self.config.request_timeout;
        let payload = match tokio::time::timeout(timeout, self.source.fetch()).await {
            Ok(fetched) => fetched?,
            Err(_) => return Err(FetchError::Timeout(timeout).into()),
        };

        let records = self.decoder.decode(&payload.body, payload.content_type.as_deref())?;
        let normalized = self.normalizer.normalize_all(&records, observed_at);
        debug!("Decoded {} record(s), {} matched", records.len(), normalized.len());

        let upserted = self.store.upsert_batch(normalized, observed_at).await;
        self.reconciler.on_cycle_complete(&upserted).await;

        Ok(CycleSummary {
            records: records.len(),
            upserted: upserted.len(),
        })
    }

    /// Run one cycle, update backoff and health, and return how long to wait
    /// before the next one.
    pub async fn poll_once(&mut self) -> Duration {
        let started = Utc::now();
        self.status.begin_attempt(started).await;

        match self.run_cycle_at(started).await {
            Ok(summary) => {
                self.backoff.reset();
                let next = self.config.poll_interval;
                info!(
                    "Poll cycle ok: {} record(s), {} event(s) upserted, next in {:?}",
                    summary.records, summary.upserted, next
                );
                self.status.record_success(started, summary.upserted, next).await;
                next
            }
            Err(e) => {
                let next = self.backoff.on_failure();
                let failures = self.backoff.consecutive_failures();
                if e.is_timeout() {
                    warn!("Poll cycle timed out (failure #{}), retrying in {:?}", failures, next);
                } else {
                    warn!("Poll cycle failed (failure #{}): {}; retrying in {:?}", failures, e, next);
                }
                self.status.record_failure(started, e.to_string(), failures, next).await;
                next
            }
        }
    }

    /// Drive cycles until `shutdown` fires. Returns at once when polling is disabled.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        if !self.config.enabled {
            info!("Polling disabled; serving cached events only");
            return;
        }
        info!(
            "Poller started for {} (interval {:?}, initial delay {:?})",
            self.source.describe(),
            self.config.poll_interval,
            self.config.initial_delay
        );

        if shutdown.sleep(self.config.initial_delay).await {
            loop {
                let next = tokio::select! {
                    next = self.poll_once() => next,
                    _ = shutdown.triggered() => break,
                };
                if !shutdown.sleep(next).await {
                    break;
                }
            }
        }

        self.status.set_state(PollerState::Stopped).await;
        info!("Poller stopped");
    }
}
