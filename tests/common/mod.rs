// Shared fixtures for integration tests
#![allow(dead_code)]

use base64::{engine::general_purpose, Engine as _};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use v16_tracker::background::{BackoffPolicy, Poller};
use v16_tracker::config::{NormalizerConfig, PollerConfig};
use v16_tracker::error::{FetchError, PersistenceError};
use v16_tracker::ingest::decoder::xor;
use v16_tracker::ingest::{Decoder, FeedPayload, FeedSource, IdentityProjection, Normalizer, RequiredAttributes};
use v16_tracker::models::{Event, EventId};
use v16_tracker::services::{DurableStore, EventStore, Reconciler};
use v16_tracker::Config;

pub const XOR_KEY: &str = "K";

/// Feed double that replays queued responses, then serves an empty list.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<FeedPayload, FetchError>>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<FeedPayload, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl FeedSource for ScriptedSource {
    fn fetch(&self) -> BoxFuture<'_, Result<FeedPayload, FetchError>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(FeedPayload::json("[]")));
        Box::pin(async move { next })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Durable store double backed by a map.
#[derive(Default)]
pub struct MemoryDurable {
    pub documents: Mutex<HashMap<EventId, Event>>,
    pub fail_writes: bool,
}

impl MemoryDurable {
    pub fn with_events(events: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            documents: Mutex::new(events.into_iter().map(|e| (e.id.clone(), e)).collect()),
            fail_writes: false,
        })
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.documents.lock().unwrap().get(&EventId::from(id)).cloned()
    }
}

impl DurableStore for MemoryDurable {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<Event>, PersistenceError>> {
        let events: Vec<Event> = self.documents.lock().unwrap().values().cloned().collect();
        Box::pin(async move { Ok(events) })
    }

    fn upsert_many<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            if self.fail_writes {
                return Err(PersistenceError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            let mut documents = self.documents.lock().unwrap();
            for event in events {
                documents.insert(event.id.clone(), event.clone());
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A record that passes the V16 filter.
pub fn beacon_record(id: &str, lat: f64, lon: f64) -> Value {
    json!({
        "id": id,
        "fuente": "DGT3.0",
        "subtipoVialidad": "Advertencia",
        "subcausa": "Vehículo detenido",
        "carretera": "A-5",
        "pkIni": 12.4,
        "provinciaIni": "Madrid",
        "geometria": {"type": "Point", "coordinates": [lon, lat]}
    })
}

pub fn roadworks_record(id: &str) -> Value {
    json!({
        "id": id,
        "fuente": "DGT3.0",
        "subtipoVialidad": "Obras",
        "subcausa": "Mantenimiento",
        "geometria": {"type": "Point", "coordinates": [-3.0, 40.0]}
    })
}

pub fn feed(records: Vec<Value>) -> FeedPayload {
    FeedPayload::json(json!({ "situationsRecords": records }).to_string())
}

/// The feed's obfuscated form: XOR with the key, then base64, served as text.
pub fn obfuscated_feed(records: Vec<Value>) -> FeedPayload {
    let plain = json!({ "situationsRecords": records }).to_string();
    let scrambled = xor(plain.as_bytes(), XOR_KEY.as_bytes()).unwrap();
    FeedPayload {
        body: general_purpose::STANDARD.encode(scrambled).into_bytes(),
        content_type: Some("text/plain; charset=utf-8".to_string()),
    }
}

pub fn poller_config() -> PollerConfig {
    PollerConfig {
        enabled: true,
        poll_interval: Duration::from_secs(45),
        initial_delay: Duration::ZERO,
        backoff: BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
            jitter_fraction: 0.0,
        },
        request_timeout: Duration::from_secs(10),
    }
}

pub fn normalizer() -> Normalizer {
    Normalizer::new(&NormalizerConfig {
        required: RequiredAttributes::default(),
        identity: IdentityProjection::default(),
        retain_raw: false,
        timezone: chrono_tz::Europe::Madrid,
    })
}

pub fn poller(source: Arc<dyn FeedSource>, store: EventStore, reconciler: Reconciler) -> Poller<rand::rngs::StdRng> {
    use rand::SeedableRng;
    Poller::new(
        source,
        Decoder::new(XOR_KEY),
        normalizer(),
        store,
        reconciler,
        poller_config(),
        rand::rngs::StdRng::seed_from_u64(42),
    )
}

/// Config built from defaults plus `overrides`.
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let vars: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}
