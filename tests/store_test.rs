mod common;

use chrono::{Duration, TimeZone, Utc};
use futures::future::join_all;

use common::*;
use v16_tracker::models::{EventFilter, EventId, EventStatus, RawRecord};
use v16_tracker::services::EventStore;

fn normalized(id: &str, lat: f64) -> v16_tracker::models::NormalizedEvent {
    let record = RawRecord::new(beacon_record(id, lat, -3.0).as_object().cloned().unwrap());
    normalizer().normalize(&record, Utc::now()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_sweeps_and_reads_stay_consistent() {
    let store = EventStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 11, 20, 8, 0, 0).unwrap();

    let writers = (0..8).map(|w| {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..25 {
                let id = format!("w{}-{}", w, round % 5);
                store.upsert(normalized(&id, 40.0 + w as f64), t0 + Duration::seconds(round)).await;
            }
        })
    });
    let readers = (0..4).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                for event in store.list(EventFilter::default()).await {
                    assert!(event.last_seen_at >= event.first_seen_at);
                }
            }
        })
    });
    let sweeper = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                store.sweep(t0, Duration::seconds(60), Duration::seconds(300)).await;
                tokio::task::yield_now().await;
            }
        })
    };

    for result in join_all(writers.chain(readers).chain(std::iter::once(sweeper))).await {
        result.unwrap();
    }

    assert_eq!(store.len().await, 40);
    let all = store.list(EventFilter::default()).await;
    assert!(all.iter().all(|e| e.status == EventStatus::Active));
    assert!(all.windows(2).all(|pair| pair[0].last_seen_at >= pair[1].last_seen_at));
}

#[tokio::test]
async fn staleness_transitions_are_monotonic() {
    let store = EventStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 11, 20, 8, 0, 0).unwrap();
    store.upsert(normalized("a", 40.0), t0).await;
    let (stale, gc) = (Duration::seconds(60), Duration::seconds(300));

    let mut seen = Vec::new();
    for offset in (0..=400).step_by(20) {
        store.sweep(t0 + Duration::seconds(offset), stale, gc).await;
        seen.push(store.get(&EventId::from("a")).await.map(|e| e.status));
    }

    // Active, then Lost, then absent; never back
    let rank = |s: &Option<EventStatus>| match s {
        Some(EventStatus::Active) => 0,
        Some(EventStatus::Lost) => 1,
        None => 2,
    };
    assert!(seen.windows(2).all(|pair| rank(&pair[0]) <= rank(&pair[1])));
    assert_eq!(seen.first(), Some(&Some(EventStatus::Active)));
    assert_eq!(seen.last(), Some(&None));
}

#[tokio::test]
async fn out_of_order_sightings_never_move_freshness_back() {
    let store = EventStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 11, 20, 8, 0, 0).unwrap();
    store.upsert(normalized("a", 40.0), t0 + Duration::seconds(30)).await;
    let event = store.upsert(normalized("a", 40.0), t0).await;
    assert_eq!(event.last_seen_at, t0 + Duration::seconds(30));
}

#[tokio::test]
async fn reads_complete_while_a_large_sweep_is_in_progress() {
    let store = EventStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 11, 20, 8, 0, 0).unwrap();
    let seeded: Vec<_> = (0..2_000)
        .map(|i| v16_tracker::models::Event::new(normalized(&format!("e{}", i), 40.0), t0))
        .collect();
    store.load_all(seeded).await;

    let sweep = tokio::spawn({
        let store = store.clone();
        async move { store.sweep(t0 + Duration::seconds(61), Duration::seconds(60), Duration::seconds(300)).await }
    });
    let reader = tokio::spawn({
        let store = store.clone();
        async move {
            let hit = store.get(&EventId::from("e0")).await;
            let lost_so_far = store.list(EventFilter::status(EventStatus::Lost)).await.len();
            (hit.is_some(), lost_so_far)
        }
    });

    let (found, lost_so_far) = reader.await.unwrap();
    let report = sweep.await.unwrap();

    assert!(found);
    // the reader ran between two entry updates, not after the whole pass
    assert!(lost_so_far < 2_000, "reader waited for the full sweep");
    assert_eq!(report.marked_lost.len(), 2_000);
    assert_eq!(store.list(EventFilter::status(EventStatus::Lost)).await.len(), 2_000);
}
